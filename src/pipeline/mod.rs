//! Fetch pipelines for remote assets.
//!
//! Each pipeline pairs a persistent [`crate::cache::CacheManager`] with a
//! bounded-concurrency fetcher: link card metadata from Open Graph tags,
//! intrinsic image dimensions, and ThumbHash placeholders. Single fetches
//! return `Option` so a dead URL degrades the output instead of failing a
//! build; batch operations return a map with one entry per requested key.

mod batch;
mod image_size;
mod open_graph;
mod thumbs;

use reqwest::StatusCode;
use url::Url;

pub use image_size::{ImageDimensions, ImageSizeOptions, ImageSizePipeline};
pub use open_graph::{OpenGraphData, OpenGraphOptions, OpenGraphPipeline};
pub use thumbs::{HashStrategy, ThumbHashOptions, ThumbHashPipeline, ThumbHashResult};

/// Why a single fetch produced no value. Pipelines log these and report a
/// miss; they never bubble past the pipeline boundary.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("unexpected content type {0:?}")]
    ContentType(Option<String>),

    #[error("could not determine image dimensions")]
    Dimensions,

    #[error("could not parse document: {0}")]
    Parse(String),
}

/// Parse a fetch target, accepting only absolute http(s) URLs. Everything
/// else (relative paths, data URLs, other schemes) is not fetchable.
pub(crate) fn parse_fetch_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    match url.scheme() {
        "http" | "https" => Some(url),
        _ => None,
    }
}
