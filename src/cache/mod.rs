//! Brezza Cache System
//!
//! Persistent on-disk caching for fetched artifacts. Every pipeline owns a
//! [`CacheManager`] configured with one of two layouts:
//!
//! - **Single-file**: one JSON index holding all entries, rewritten on each
//!   mutation. Used for small datasets read in bulk (image dimensions,
//!   thumbnail hashes).
//! - **Multi-file**: one JSON file per key, named by the SHA-256 digest of
//!   the key. Used for link card metadata, where entries are large and
//!   independent.
//!
//! Entries carry their write timestamp and expire lazily: a read that finds
//! an entry older than the configured TTL removes it and reports a miss.

mod clock;
mod lock;
mod manager;

pub use clock::{Clock, SystemClock};
pub use manager::{CacheManager, CacheOptions, CacheStrategy, DEFAULT_TTL};
