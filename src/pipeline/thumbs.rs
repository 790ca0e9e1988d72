//! ThumbHash placeholders and capture metadata for remote images.
//!
//! Downloads the full image, hashes a thumbnail of it into a compact
//! ThumbHash, and decodes that straight back into an inline BMP data URL
//! that templates can ship as a blur-up placeholder. EXIF capture date and
//! GPS position are extracted along the way when the image carries them.
//!
//! Pixel decoding sits behind the `decode` cargo feature. Without it (or
//! when a decoder rejects the image) the pipeline degrades to a uniform
//! gray placeholder at the image's true aspect ratio rather than failing.

use std::{collections::HashMap, io::Cursor, path::PathBuf, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheManager, CacheOptions, CacheStrategy};
use crate::config::ThumbHashSettings;
use crate::infra::client::build_client;
use crate::util::thumbhash::{rgba_to_thumb_hash, thumb_hash_to_data_url};

use super::batch::collect_keyed;
use super::{FetchError, parse_fetch_url};

/// Hash input is thumbnailed to at most this many pixels per side.
#[cfg(feature = "decode")]
const THUMBNAIL_LIMIT: u32 = 100;

/// Placeholder grid resolution along the longer edge.
const PLACEHOLDER_BASE: f64 = 8.0;

/// ThumbHash and metadata for one remote image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbHashResult {
    /// Base64 of the raw ThumbHash bytes.
    pub thumbhash: String,
    /// Inline BMP rendering of the hash, ready for an `img` src.
    #[serde(rename = "dataURL")]
    pub data_url: String,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    /// Capture date from EXIF, `YYYY-MM-DD`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Capture position from EXIF GPS, `lat, lon` with four decimals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ThumbHashResult {
    /// Fill the caller's date and location slots from this result without
    /// overwriting values the caller already has.
    pub fn merge_metadata(&self, date: &mut Option<String>, location: &mut Option<String>) {
        if date.is_none() {
            *date = self.date.clone();
        }
        if location.is_none() {
            *location = self.location.clone();
        }
    }
}

/// How hash bytes are produced from a downloaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStrategy {
    /// Decode pixels and hash a real thumbnail.
    #[cfg(feature = "decode")]
    Pixels,
    /// Uniform gray grid at the image's aspect ratio.
    Placeholder,
}

impl Default for HashStrategy {
    fn default() -> Self {
        #[cfg(feature = "decode")]
        {
            Self::Pixels
        }
        #[cfg(not(feature = "decode"))]
        {
            Self::Placeholder
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThumbHashOptions {
    pub cache_path: PathBuf,
    pub ttl: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for ThumbHashOptions {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from(".brezza/thumbhashes.json"),
            ttl: Duration::from_millis(30 * 24 * 60 * 60 * 1000),
            timeout: Duration::from_secs(15),
            concurrency: 3,
        }
    }
}

impl From<&ThumbHashSettings> for ThumbHashOptions {
    fn from(settings: &ThumbHashSettings) -> Self {
        Self {
            cache_path: settings.cache_path.clone(),
            ttl: settings.ttl,
            timeout: settings.timeout,
            concurrency: settings.concurrency.get() as usize,
        }
    }
}

pub struct ThumbHashPipeline {
    cache: CacheManager<ThumbHashResult>,
    client: Client,
    concurrency: usize,
    strategy: HashStrategy,
}

impl ThumbHashPipeline {
    pub fn new(options: ThumbHashOptions) -> Result<Self, reqwest::Error> {
        Self::with_strategy(options, HashStrategy::default())
    }

    pub fn with_strategy(
        options: ThumbHashOptions,
        strategy: HashStrategy,
    ) -> Result<Self, reqwest::Error> {
        let cache = Self::build_cache(options.cache_path, options.ttl);
        let client = build_client(options.timeout)?;
        Ok(Self {
            cache,
            client,
            concurrency: options.concurrency,
            strategy,
        })
    }

    /// Hash one image URL, from cache when fresh. Returns `None` on any
    /// fetch failure; failures are logged, not cached. URLs that are not
    /// absolute http(s) are rejected before the cache is consulted.
    pub async fn generate(&self, url: &str) -> Option<ThumbHashResult> {
        let parsed = match parse_fetch_url(url) {
            Some(parsed) => parsed,
            None => {
                warn!(target: "pipeline::thumbs", url, "Skipping unfetchable URL");
                return None;
            }
        };
        if let Some(cached) = self.cache.get(url) {
            return Some(cached);
        }
        match self.generate_remote(url, parsed).await {
            Ok(result) => {
                self.cache.set(url, result.clone());
                Some(result)
            }
            Err(err) => {
                counter!("brezza_fetch_failed_total", "pipeline" => "thumbhash").increment(1);
                warn!(target: "pipeline::thumbs", url, error = %err, "ThumbHash generation failed");
                None
            }
        }
    }

    /// Hash every URL, at most `concurrency` downloads in flight.
    pub async fn batch(&self, urls: &[String]) -> HashMap<String, Option<ThumbHashResult>> {
        collect_keyed(urls, self.concurrency, |url| async move {
            self.generate(&url).await
        })
        .await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop the on-disk cache without constructing a pipeline. Unlike
    /// [`Self::new`] this cannot fail: no HTTP client is built.
    pub fn purge_cache(options: ThumbHashOptions) {
        Self::build_cache(options.cache_path, options.ttl).clear();
    }

    fn build_cache(cache_path: PathBuf, ttl: Duration) -> CacheManager<ThumbHashResult> {
        CacheManager::new(
            CacheOptions::new(CacheStrategy::SingleFile, cache_path)
                .ttl(ttl)
                .log_prefix("thumbhash"),
        )
    }

    async fn generate_remote(
        &self,
        raw_url: &str,
        url: url::Url,
    ) -> Result<ThumbHashResult, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let bytes = response.bytes().await?;

        let size = imagesize::blob_size(&bytes).map_err(|_| FetchError::Dimensions)?;
        let width = u32::try_from(size.width).map_err(|_| FetchError::Dimensions)?;
        let height = u32::try_from(size.height).map_err(|_| FetchError::Dimensions)?;
        if width == 0 || height == 0 {
            return Err(FetchError::Dimensions);
        }

        let (date, location) = exif_metadata(&bytes);

        let hash = match self.strategy {
            #[cfg(feature = "decode")]
            HashStrategy::Pixels => pixel_hash(raw_url, &bytes, width, height),
            HashStrategy::Placeholder => {
                debug!(target: "pipeline::thumbs", url = raw_url, "Using placeholder hash");
                placeholder_hash(width, height)
            }
        };
        let data_url = thumb_hash_to_data_url(&hash).ok_or(FetchError::Dimensions)?;

        Ok(ThumbHashResult {
            thumbhash: BASE64_STANDARD.encode(&hash),
            data_url,
            width,
            height,
            aspect_ratio: width as f64 / height as f64,
            date,
            location,
        })
    }
}

#[cfg(feature = "decode")]
fn pixel_hash(url: &str, bytes: &[u8], width: u32, height: u32) -> Vec<u8> {
    match image::load_from_memory(bytes) {
        Ok(decoded) => {
            let thumb = decoded
                .thumbnail(THUMBNAIL_LIMIT, THUMBNAIL_LIMIT)
                .to_rgba8();
            let (w, h) = (thumb.width() as usize, thumb.height() as usize);
            rgba_to_thumb_hash(w, h, thumb.as_raw())
        }
        Err(err) => {
            warn!(target: "pipeline::thumbs", url, error = %err, "Decode failed, using placeholder");
            placeholder_hash(width, height)
        }
    }
}

/// Uniform gray grid at the image's true aspect ratio. Carries no detail
/// but still gives templates a correctly shaped placeholder.
fn placeholder_hash(width: u32, height: u32) -> Vec<u8> {
    let longest = width.max(height) as f64;
    let w = ((width as f64 / longest * PLACEHOLDER_BASE).round() as usize).max(1);
    let h = ((height as f64 / longest * PLACEHOLDER_BASE).round() as usize).max(1);
    let rgba: Vec<u8> = [200u8, 200, 200, 255].repeat(w * h);
    rgba_to_thumb_hash(w, h, &rgba)
}

/// Best-effort EXIF extraction: capture date as `YYYY-MM-DD` and GPS
/// position as `lat, lon`. Images without EXIF (or with partial fields)
/// yield `None` for the missing pieces.
fn exif_metadata(bytes: &[u8]) -> (Option<String>, Option<String>) {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(_) => return (None, None),
    };

    let date = exif
        .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
        .map(|field| field.display_value().to_string())
        .and_then(|value| {
            // "YYYY-MM-DD HH:MM:SS" from the display form; keep the date.
            let date = value.get(..10)?;
            (date.len() == 10).then(|| date.to_string())
        });

    let location = match (gps_coordinate(&exif, true), gps_coordinate(&exif, false)) {
        (Some(lat), Some(lon)) => Some(format!("{lat:.4}, {lon:.4}")),
        _ => None,
    };

    (date, location)
}

fn gps_coordinate(exif: &exif::Exif, latitude: bool) -> Option<f64> {
    let (value_tag, ref_tag) = if latitude {
        (exif::Tag::GPSLatitude, exif::Tag::GPSLatitudeRef)
    } else {
        (exif::Tag::GPSLongitude, exif::Tag::GPSLongitudeRef)
    };

    let field = exif.get_field(value_tag, exif::In::PRIMARY)?;
    let exif::Value::Rational(parts) = &field.value else {
        return None;
    };
    if parts.len() < 3 {
        return None;
    }
    let degrees = parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;

    let reference = exif
        .get_field(ref_tag, exif::In::PRIMARY)
        .map(|field| field.display_value().to_string())
        .unwrap_or_default();
    let sign = if reference.starts_with('S') || reference.starts_with('W') {
        -1.0
    } else {
        1.0
    };
    Some(sign * degrees)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_hash_keeps_orientation() {
        let landscape = placeholder_hash(1600, 900);
        // Landscape flag is the top bit of the 16-bit header.
        assert_ne!(landscape[4] & 0x80, 0);
        let portrait = placeholder_hash(900, 1600);
        assert_eq!(portrait[4] & 0x80, 0);
    }

    #[test]
    fn placeholder_hash_handles_extreme_ratios() {
        // A 100:1 panorama must still produce a non-empty grid.
        let hash = placeholder_hash(4000, 40);
        assert!(hash.len() >= 5);
    }

    #[test]
    fn merge_metadata_never_overwrites() {
        let result = ThumbHashResult {
            thumbhash: String::new(),
            data_url: String::new(),
            width: 1,
            height: 1,
            aspect_ratio: 1.0,
            date: Some("2024-05-01".to_string()),
            location: Some("1.0000, 2.0000".to_string()),
        };
        let mut date = Some("2020-01-01".to_string());
        let mut location = None;
        result.merge_metadata(&mut date, &mut location);
        assert_eq!(date.as_deref(), Some("2020-01-01"));
        assert_eq!(location.as_deref(), Some("1.0000, 2.0000"));
    }

    #[test]
    fn exif_metadata_on_plain_bytes_is_empty() {
        let (date, location) = exif_metadata(b"not an image");
        assert!(date.is_none());
        assert!(location.is_none());
    }

    #[test]
    fn data_url_field_serializes_with_exact_name() {
        let result = ThumbHashResult {
            thumbhash: "AAA".to_string(),
            data_url: "data:image/bmp;base64,QQ==".to_string(),
            width: 2,
            height: 1,
            aspect_ratio: 2.0,
            date: None,
            location: None,
        };
        let json = serde_json::to_string(&result).expect("serializable");
        assert!(json.contains(r#""dataURL":"#));
        assert!(json.contains(r#""aspectRatio":2.0"#));
        assert!(!json.contains("date"));
    }
}
