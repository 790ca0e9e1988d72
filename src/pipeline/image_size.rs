//! Intrinsic image dimensions without downloading whole files.
//!
//! Dimensions live in the header region of every common format, so the
//! prober reads the response body chunk by chunk and stops as soon as the
//! accumulated prefix parses, bounded by a fixed byte budget.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{CacheManager, CacheOptions, CacheStrategy};
use crate::config::ImageSizeSettings;
use crate::infra::client::build_client;
use crate::util::aspect::simplify_ratio;

use super::batch::collect_keyed;
use super::{FetchError, parse_fetch_url};

/// Headers parse within this prefix for every format we care about; a body
/// that does not is treated as undecodable.
const PROBE_BYTE_LIMIT: usize = 64 * 1024;

/// Intrinsic pixel dimensions of a remote image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
    /// Reduced ratio for the CSS `aspect-ratio` property, e.g. `16/9`.
    pub aspect_ratio: String,
}

#[derive(Debug, Clone)]
pub struct ImageSizeOptions {
    pub cache_path: PathBuf,
    pub ttl: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for ImageSizeOptions {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from(".brezza/image-sizes.json"),
            ttl: Duration::from_millis(7 * 24 * 60 * 60 * 1000),
            timeout: Duration::from_secs(10),
            concurrency: 5,
        }
    }
}

impl From<&ImageSizeSettings> for ImageSizeOptions {
    fn from(settings: &ImageSizeSettings) -> Self {
        Self {
            cache_path: settings.cache_path.clone(),
            ttl: settings.ttl,
            timeout: settings.timeout,
            concurrency: settings.concurrency.get() as usize,
        }
    }
}

pub struct ImageSizePipeline {
    cache: CacheManager<ImageDimensions>,
    client: Client,
    concurrency: usize,
}

impl ImageSizePipeline {
    pub fn new(options: ImageSizeOptions) -> Result<Self, reqwest::Error> {
        let cache = Self::build_cache(options.cache_path, options.ttl);
        let client = build_client(options.timeout)?;
        Ok(Self {
            cache,
            client,
            concurrency: options.concurrency,
        })
    }

    /// Dimensions for one image URL, from cache when fresh. Returns `None`
    /// on any fetch or parse failure; failures are logged, not cached. URLs
    /// that are not absolute http(s) are rejected before the cache is
    /// consulted.
    pub async fn fetch(&self, url: &str) -> Option<ImageDimensions> {
        let parsed = match parse_fetch_url(url) {
            Some(parsed) => parsed,
            None => {
                warn!(target: "pipeline::image_size", url, "Skipping unfetchable URL");
                return None;
            }
        };
        if let Some(cached) = self.cache.get(url) {
            return Some(cached);
        }
        match self.probe_remote(parsed).await {
            Ok(dimensions) => {
                self.cache.set(url, dimensions.clone());
                Some(dimensions)
            }
            Err(err) => {
                counter!("brezza_fetch_failed_total", "pipeline" => "image-size").increment(1);
                warn!(target: "pipeline::image_size", url, error = %err, "Image probe failed");
                None
            }
        }
    }

    /// Dimensions for every URL, at most `concurrency` probes in flight.
    pub async fn batch(&self, urls: &[String]) -> HashMap<String, Option<ImageDimensions>> {
        collect_keyed(urls, self.concurrency, |url| async move {
            self.fetch(&url).await
        })
        .await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop the on-disk cache without constructing a pipeline. Unlike
    /// [`Self::new`] this cannot fail: no HTTP client is built.
    pub fn purge_cache(options: ImageSizeOptions) {
        Self::build_cache(options.cache_path, options.ttl).clear();
    }

    fn build_cache(cache_path: PathBuf, ttl: Duration) -> CacheManager<ImageDimensions> {
        CacheManager::new(
            CacheOptions::new(CacheStrategy::SingleFile, cache_path)
                .ttl(ttl)
                .log_prefix("image-size"),
        )
    }

    async fn probe_remote(&self, url: url::Url) -> Result<ImageDimensions, FetchError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        // Parse after every chunk so the connection drops as soon as the
        // header region is in hand. Each iteration already attempted a parse,
        // so running out of stream or budget means undecodable.
        let mut prefix: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let take = chunk.len().min(PROBE_BYTE_LIMIT - prefix.len());
            prefix.extend_from_slice(&chunk[..take]);
            if let Ok(size) = imagesize::blob_size(&prefix) {
                return dimensions_from(size);
            }
            if prefix.len() >= PROBE_BYTE_LIMIT {
                return Err(FetchError::Dimensions);
            }
        }
        Err(FetchError::Dimensions)
    }
}

fn dimensions_from(size: imagesize::ImageSize) -> Result<ImageDimensions, FetchError> {
    let width = u32::try_from(size.width).map_err(|_| FetchError::Dimensions)?;
    let height = u32::try_from(size.height).map_err(|_| FetchError::Dimensions)?;
    if width == 0 || height == 0 {
        return Err(FetchError::Dimensions);
    }
    Ok(ImageDimensions {
        width,
        height,
        aspect_ratio: simplify_ratio(width, height),
    })
}
