//! Link card metadata from Open Graph tags.
//!
//! Fetches a page, pulls `og:*` meta properties out of the head, and falls
//! back to the `<title>` element and `meta[name=description]` when a page
//! does not carry Open Graph tags. A page with no usable metadata at all
//! still yields a synthetic record naming its host, so templates always have
//! something to render. Failures, by contrast, are never cached: a dead URL
//! is retried on the next run.

use std::{cell::RefCell, collections::HashMap, path::PathBuf, rc::Rc, time::Duration};

use lol_html::{RewriteStrSettings, element, rewrite_str, text};
use metrics::counter;
use reqwest::{Client, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheManager, CacheOptions, CacheStrategy};
use crate::config::LinkCardSettings;
use crate::infra::client::build_client;

use super::batch::collect_keyed;
use super::{FetchError, parse_fetch_url};

/// Open Graph metadata for one URL. All fields optional; absent fields are
/// omitted from the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OpenGraphData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenGraphOptions {
    pub cache_path: PathBuf,
    pub ttl: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for OpenGraphOptions {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from(".brezza/link-card"),
            ttl: Duration::from_millis(24 * 60 * 60 * 1000),
            timeout: Duration::from_secs(10),
            concurrency: 5,
        }
    }
}

impl From<&LinkCardSettings> for OpenGraphOptions {
    fn from(settings: &LinkCardSettings) -> Self {
        Self {
            cache_path: settings.cache_path.clone(),
            ttl: settings.ttl,
            timeout: settings.timeout,
            concurrency: settings.concurrency.get() as usize,
        }
    }
}

pub struct OpenGraphPipeline {
    cache: CacheManager<OpenGraphData>,
    client: Client,
    concurrency: usize,
}

impl OpenGraphPipeline {
    pub fn new(options: OpenGraphOptions) -> Result<Self, reqwest::Error> {
        let cache = Self::build_cache(options.cache_path, options.ttl);
        let client = build_client(options.timeout)?;
        Ok(Self {
            cache,
            client,
            concurrency: options.concurrency,
        })
    }

    /// Metadata for one URL, from cache when fresh. Returns `None` on any
    /// fetch failure; failures are logged, not cached. URLs that are not
    /// absolute http(s) are rejected before the cache is consulted.
    pub async fn fetch(&self, url: &str) -> Option<OpenGraphData> {
        let parsed = match parse_fetch_url(url) {
            Some(parsed) => parsed,
            None => {
                warn!(target: "pipeline::open_graph", url, "Skipping unfetchable URL");
                return None;
            }
        };
        if let Some(cached) = self.cache.get(url) {
            return Some(cached);
        }
        match self.fetch_remote(url, parsed).await {
            Ok(data) => {
                self.cache.set(url, data.clone());
                Some(data)
            }
            Err(err) => {
                counter!("brezza_fetch_failed_total", "pipeline" => "link-card").increment(1);
                warn!(target: "pipeline::open_graph", url, error = %err, "Link card fetch failed");
                None
            }
        }
    }

    /// Metadata for every URL, at most `concurrency` fetches in flight. The
    /// result always holds one entry per distinct URL.
    pub async fn batch(&self, urls: &[String]) -> HashMap<String, Option<OpenGraphData>> {
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
    pub fn purge_cache(options: OpenGraphOptions) {
        Self::build_cache(options.cache_path, options.ttl).clear();
    }

    fn build_cache(cache_path: PathBuf, ttl: Duration) -> CacheManager<OpenGraphData> {
        CacheManager::new(
            CacheOptions::new(CacheStrategy::MultiFile, cache_path)
                .ttl(ttl)
                .log_prefix("link-card"),
        )
    }

    async fn fetch_remote(&self, raw_url: &str, url: url::Url) -> Result<OpenGraphData, FetchError> {
        let host = url.host_str().map(str::to_string);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let is_html = content_type
            .as_deref()
            .is_some_and(|value| value.to_ascii_lowercase().contains("text/html"));
        if !is_html {
            return Err(FetchError::ContentType(content_type));
        }

        let body = response.text().await?;
        let mut data = extract_metadata(&body)?;

        if data.title.is_none() && data.description.is_none() && data.image.is_none() {
            // Nothing usable on the page; synthesize a minimal card from the
            // host so callers still get a rendered link.
            debug!(target: "pipeline::open_graph", url = raw_url, "No metadata found, synthesizing");
            data.title = Some(host.unwrap_or_else(|| raw_url.to_string()));
        }
        if data.url.is_none() {
            data.url = Some(raw_url.to_string());
        }
        Ok(data)
    }
}

#[derive(Debug, Clone, Default)]
struct ExtractState {
    og: OpenGraphData,
    fallback_title: String,
    fallback_description: Option<String>,
}

/// Pull Open Graph properties and plain-HTML fallbacks out of a document.
/// The first occurrence of each property wins.
fn extract_metadata(html: &str) -> Result<OpenGraphData, FetchError> {
    let state = Rc::new(RefCell::new(ExtractState::default()));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("meta[property]", {
                    let state = Rc::clone(&state);
                    move |el| {
                        let property = el
                            .get_attribute("property")
                            .map(|value| value.trim().to_ascii_lowercase());
                        let content = el
                            .get_attribute("content")
                            .map(|value| value.trim().to_string())
                            .filter(|value| !value.is_empty());
                        if let (Some(property), Some(content)) = (property, content) {
                            let mut state = state.borrow_mut();
                            let og = &mut state.og;
                            let slot = match property.as_str() {
                                "og:title" => &mut og.title,
                                "og:description" => &mut og.description,
                                "og:image" => &mut og.image,
                                "og:url" => &mut og.url,
                                "og:site_name" => &mut og.site_name,
                                "og:type" => &mut og.kind,
                                _ => return Ok(()),
                            };
                            if slot.is_none() {
                                *slot = Some(content);
                            }
                        }
                        Ok(())
                    }
                }),
                element!("meta[name]", {
                    let state = Rc::clone(&state);
                    move |el| {
                        let is_description = el
                            .get_attribute("name")
                            .is_some_and(|name| name.trim().eq_ignore_ascii_case("description"));
                        if is_description
                            && let Some(content) = el
                                .get_attribute("content")
                                .map(|value| value.trim().to_string())
                                .filter(|value| !value.is_empty())
                        {
                            let mut state = state.borrow_mut();
                            if state.fallback_description.is_none() {
                                state.fallback_description = Some(content);
                            }
                        }
                        Ok(())
                    }
                }),
                text!("head > title", {
                    let state = Rc::clone(&state);
                    move |chunk| {
                        state.borrow_mut().fallback_title.push_str(chunk.as_str());
                        Ok(())
                    }
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| FetchError::Parse(err.to_string()))?;

    let state = Rc::try_unwrap(state)
        .map(RefCell::into_inner)
        .unwrap_or_else(|rc| rc.borrow().clone());

    let mut data = state.og;
    if data.title.is_none() {
        let fallback = state.fallback_title.trim();
        if !fallback.is_empty() {
            data.title = Some(fallback.to_string());
        }
    }
    if data.description.is_none() {
        data.description = state.fallback_description;
    }
    Ok(data)
}
