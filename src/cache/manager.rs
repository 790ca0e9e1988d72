//! Generic persistent key/value cache with two on-disk layouts.
//!
//! Single-file keeps every entry in one JSON index and rewrites it wholesale
//! on each mutation; multi-file writes one content-addressed JSON file per
//! key. Both layouts apply the same TTL policy and expire entries lazily on
//! the read that discovers them stale.

use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use metrics::counter;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::clock::{Clock, SystemClock};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::manager";

/// Default entry lifetime: 7 days.
pub const DEFAULT_TTL: Duration = Duration::from_millis(604_800_000);

/// Physical layout of the cache on disk.
///
/// `SingleFile` favors small, frequently touched datasets (one file, O(n)
/// rewrite per mutation); `MultiFile` favors many independent entries
/// (per-entry random access, directory listing cost on `clear`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    SingleFile,
    MultiFile,
}

/// Construction options for a [`CacheManager`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Storage layout.
    pub strategy: CacheStrategy,
    /// Index file (single-file) or entry directory (multi-file).
    pub cache_path: PathBuf,
    /// Entry lifetime; entries older than this read as absent.
    pub ttl: Duration,
    /// Identifies this cache in log events and metric labels.
    pub log_prefix: String,
}

impl CacheOptions {
    pub fn new(strategy: CacheStrategy, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            strategy,
            cache_path: cache_path.into(),
            ttl: DEFAULT_TTL,
            log_prefix: "cache".to_string(),
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = prefix.into();
        self
    }
}

/// One persisted record: the value plus its wall-clock write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry<T> {
    data: T,
    timestamp: u64,
}

/// Persistent key/value store parameterized over the cached value type.
///
/// All operations are best-effort: `get`, `set`, and `clear` never panic and
/// never surface errors. A failed read degrades to a miss, a failed write is
/// dropped, and each internal failure logs exactly one warning. The cache
/// must never be the reason a build fails.
pub struct CacheManager<T> {
    strategy: CacheStrategy,
    cache_path: PathBuf,
    ttl_ms: u64,
    log_prefix: String,
    clock: Arc<dyn Clock>,
    // Single-file strategy only: lazily loaded in-memory index.
    index: Mutex<Option<BTreeMap<String, CacheEntry<T>>>>,
}

impl<T> CacheManager<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(options: CacheOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Construct with an explicit clock. Intended for tests that need to
    /// control TTL expiry.
    pub fn with_clock(options: CacheOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            strategy: options.strategy,
            cache_path: options.cache_path,
            ttl_ms: options.ttl.as_millis() as u64,
            log_prefix: options.log_prefix,
            clock,
            index: Mutex::new(None),
        }
    }

    /// Look up a fresh entry. Expired entries read as absent and are removed
    /// from the backing store by the read that discovers them.
    pub fn get(&self, key: &str) -> Option<T> {
        let hit = match self.strategy {
            CacheStrategy::SingleFile => self.get_single_file(key),
            CacheStrategy::MultiFile => self.get_multi_file(key),
        };
        if hit.is_some() {
            counter!("brezza_cache_hit_total", "cache" => self.log_prefix.clone()).increment(1);
        } else {
            counter!("brezza_cache_miss_total", "cache" => self.log_prefix.clone()).increment(1);
        }
        hit
    }

    /// Store a value under `key`, stamped with the current clock time.
    /// Immediately durable: the backing file is written before returning.
    pub fn set(&self, key: &str, data: T) {
        match self.strategy {
            CacheStrategy::SingleFile => self.set_single_file(key, data),
            CacheStrategy::MultiFile => self.set_multi_file(key, data),
        }
    }

    /// Drop every entry. Single-file deletes the index file and forgets the
    /// in-memory index; multi-file unlinks every file in the cache directory
    /// (non-recursive).
    pub fn clear(&self) {
        let result = match self.strategy {
            CacheStrategy::SingleFile => {
                *mutex_lock(&self.index, SOURCE, "clear") = None;
                match fs::remove_file(&self.cache_path) {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
                    _ => Ok(()),
                }
            }
            CacheStrategy::MultiFile => self.clear_directory(),
        };
        if let Err(err) = result {
            warn!(
                target: "cache",
                prefix = %self.log_prefix,
                path = %self.cache_path.display(),
                error = %err,
                "Failed to clear cache"
            );
        }
    }

    fn expired(&self, timestamp: u64) -> bool {
        self.clock.now_ms().saturating_sub(timestamp) > self.ttl_ms
    }

    // ========================================================================
    // Single-file strategy
    // ========================================================================

    fn get_single_file(&self, key: &str) -> Option<T> {
        let mut slot = mutex_lock(&self.index, SOURCE, "get");
        let index = self.load_index(&mut slot);
        let entry = index.get(key)?;
        let timestamp = entry.timestamp;
        let data = entry.data.clone();
        if self.expired(timestamp) {
            index.remove(key);
            self.persist_index(index);
            counter!("brezza_cache_expired_total", "cache" => self.log_prefix.clone())
                .increment(1);
            return None;
        }
        Some(data)
    }

    fn set_single_file(&self, key: &str, data: T) {
        let timestamp = self.clock.now_ms();
        let mut slot = mutex_lock(&self.index, SOURCE, "set");
        let index = self.load_index(&mut slot);
        index.insert(key.to_string(), CacheEntry { data, timestamp });
        self.persist_index(index);
    }

    /// Lazily load the single-file index. A missing file is an empty index;
    /// an unreadable or unparseable one is discarded with a warning so a
    /// corrupt cache only ever costs a re-fetch.
    fn load_index<'a>(
        &self,
        slot: &'a mut Option<BTreeMap<String, CacheEntry<T>>>,
    ) -> &'a mut BTreeMap<String, CacheEntry<T>> {
        if slot.is_none() {
            let loaded = match fs::read_to_string(&self.cache_path) {
                Ok(raw) => match serde_json::from_str(&raw) {
                    Ok(index) => index,
                    Err(err) => {
                        warn!(
                            target: "cache",
                            prefix = %self.log_prefix,
                            path = %self.cache_path.display(),
                            error = %err,
                            "Discarding unreadable cache index"
                        );
                        BTreeMap::new()
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
                Err(err) => {
                    warn!(
                        target: "cache",
                        prefix = %self.log_prefix,
                        path = %self.cache_path.display(),
                        error = %err,
                        "Failed to read cache index"
                    );
                    BTreeMap::new()
                }
            };
            *slot = Some(loaded);
        }
        slot.get_or_insert_with(BTreeMap::new)
    }

    fn persist_index(&self, index: &BTreeMap<String, CacheEntry<T>>) {
        let result = (|| -> io::Result<()> {
            if let Some(parent) = self.cache_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(index).map_err(io::Error::other)?;
            fs::write(&self.cache_path, json)
        })();
        if let Err(err) = result {
            warn!(
                target: "cache",
                prefix = %self.log_prefix,
                path = %self.cache_path.display(),
                error = %err,
                "Failed to write cache index"
            );
        }
    }

    // ========================================================================
    // Multi-file strategy
    // ========================================================================

    /// Content-addressed entry file: hex digest of the key. The digest is a
    /// stable file name, not a uniqueness guarantee.
    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.cache_path.join(format!("{}.json", hex::encode(digest)))
    }

    fn get_multi_file(&self, key: &str) -> Option<T> {
        let path = self.entry_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(
                    target: "cache",
                    prefix = %self.log_prefix,
                    key,
                    error = %err,
                    "Failed to read cache entry"
                );
                return None;
            }
        };
        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    target: "cache",
                    prefix = %self.log_prefix,
                    key,
                    error = %err,
                    "Discarding unreadable cache entry"
                );
                return None;
            }
        };
        if self.expired(entry.timestamp) {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        target: "cache",
                        prefix = %self.log_prefix,
                        key,
                        error = %err,
                        "Failed to remove expired cache entry"
                    );
                }
            }
            counter!("brezza_cache_expired_total", "cache" => self.log_prefix.clone())
                .increment(1);
            return None;
        }
        Some(entry.data)
    }

    fn set_multi_file(&self, key: &str, data: T) {
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_ms(),
        };
        let result = (|| -> io::Result<()> {
            fs::create_dir_all(&self.cache_path)?;
            let json = serde_json::to_string_pretty(&entry).map_err(io::Error::other)?;
            fs::write(self.entry_path(key), json)
        })();
        if let Err(err) = result {
            warn!(
                target: "cache",
                prefix = %self.log_prefix,
                key,
                error = %err,
                "Failed to write cache entry"
            );
        }
    }

    fn clear_directory(&self) -> io::Result<()> {
        let entries = match fs::read_dir(&self.cache_path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for CacheManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("strategy", &self.strategy)
            .field("cache_path", &self.cache_path)
            .field("ttl_ms", &self.ttl_ms)
            .field("log_prefix", &self.log_prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        value: i32,
    }

    fn sample(value: i32) -> Sample {
        Sample {
            name: "sample".to_string(),
            value,
        }
    }

    #[test]
    fn options_defaults() {
        let options = CacheOptions::new(CacheStrategy::SingleFile, "/tmp/c.json");
        assert_eq!(options.ttl, DEFAULT_TTL);
        assert_eq!(options.log_prefix, "cache");
    }

    #[test]
    fn entry_path_is_stable_hex_digest() {
        let manager: CacheManager<Sample> = CacheManager::new(CacheOptions::new(
            CacheStrategy::MultiFile,
            "/tmp/entries",
        ));
        let first = manager.entry_path("https://example.com/a");
        let second = manager.entry_path("https://example.com/a");
        let other = manager.entry_path("https://example.com/b");
        assert_eq!(first, second);
        assert_ne!(first, other);
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), 64 + ".json".len());
    }

    #[test]
    fn single_file_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let manager: CacheManager<Sample> = CacheManager::new(CacheOptions::new(
            CacheStrategy::SingleFile,
            dir.path().join("index.json"),
        ));
        assert!(manager.get("a").is_none());
        manager.set("a", sample(1));
        assert_eq!(manager.get("a"), Some(sample(1)));
        // Overwrite keeps the latest value.
        manager.set("a", sample(2));
        assert_eq!(manager.get("a"), Some(sample(2)));
    }

    #[test]
    fn multi_file_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let manager: CacheManager<Sample> = CacheManager::new(CacheOptions::new(
            CacheStrategy::MultiFile,
            dir.path().join("entries"),
        ));
        manager.set("k", sample(7));
        assert_eq!(manager.get("k"), Some(sample(7)));
        assert!(manager.get("missing").is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let dir = TempDir::new().expect("temp dir");
        let manager: CacheManager<Sample> = CacheManager::new(CacheOptions::new(
            CacheStrategy::MultiFile,
            dir.path().join("entries"),
        ));
        manager.set("a", sample(1));
        manager.set("b", sample(2));
        manager.clear();
        assert!(manager.get("a").is_none());
        assert!(manager.get("b").is_none());
    }

    #[test]
    fn clear_on_missing_backing_store_is_a_no_op() {
        let dir = TempDir::new().expect("temp dir");
        let single: CacheManager<Sample> = CacheManager::new(CacheOptions::new(
            CacheStrategy::SingleFile,
            dir.path().join("never-written.json"),
        ));
        single.clear();
        let multi: CacheManager<Sample> = CacheManager::new(CacheOptions::new(
            CacheStrategy::MultiFile,
            dir.path().join("never-created"),
        ));
        multi.clear();
    }
}
