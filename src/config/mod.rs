//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const LOCAL_CONFIG_BASENAME: &str = "brezza";

const DEFAULT_LINK_CARD_CACHE_PATH: &str = ".brezza/link-card";
const DEFAULT_LINK_CARD_TTL_MS: u64 = 24 * 60 * 60 * 1000;
const DEFAULT_LINK_CARD_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_LINK_CARD_CONCURRENCY: u32 = 5;
const DEFAULT_LINK_CARD_DATA_FILE: &str = "data/link-cards.json";

const DEFAULT_IMAGE_SIZE_CACHE_PATH: &str = ".brezza/image-sizes.json";
const DEFAULT_IMAGE_SIZE_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;
const DEFAULT_IMAGE_SIZE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_IMAGE_SIZE_CONCURRENCY: u32 = 5;
const DEFAULT_IMAGE_SIZE_DATA_FILE: &str = "data/image-sizes.json";

const DEFAULT_THUMBHASH_CACHE_PATH: &str = ".brezza/thumbhashes.json";
const DEFAULT_THUMBHASH_TTL_MS: u64 = 30 * 24 * 60 * 60 * 1000;
const DEFAULT_THUMBHASH_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_THUMBHASH_CONCURRENCY: u32 = 3;
const DEFAULT_THUMBHASH_DATA_FILE: &str = "data/thumbhashes.json";

/// Command-line arguments for the Brezza binary.
#[derive(Debug, Parser)]
#[command(name = "brezza", version, about = "Remote-asset warmer for static blogs")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "BREZZA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Fetch assets for a list of URLs and write the pipeline's data file.
    Warm(WarmArgs),
    /// Delete cached entries.
    Clear(ClearArgs),
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub overrides: FetchOverrides,

    /// Which pipeline to run.
    #[arg(long, value_enum)]
    pub kind: PipelineKind,

    /// File with one URL per line; blank lines and `#` comments are skipped.
    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,

    /// Where to write the resulting JSON map; defaults to the pipeline's
    /// configured data file.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct ClearArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Clear one pipeline's cache; when omitted, all caches are cleared.
    #[arg(long, value_enum)]
    pub kind: Option<PipelineKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PipelineKind {
    LinkCard,
    ImageSize,
    Thumbhash,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct FetchOverrides {
    /// Override the selected pipeline's maximum concurrent fetches.
    #[arg(long, value_name = "N")]
    pub concurrency: Option<u32>,

    /// Override the selected pipeline's per-request timeout in milliseconds.
    #[arg(long = "timeout-ms", value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Override the selected pipeline's cache location.
    #[arg(long = "cache-path", value_name = "PATH")]
    pub cache_path: Option<PathBuf>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub link_card: LinkCardSettings,
    pub image_size: ImageSizeSettings,
    pub thumbhash: ThumbHashSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct LinkCardSettings {
    pub cache_path: PathBuf,
    pub ttl: Duration,
    pub timeout: Duration,
    pub concurrency: NonZeroU32,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
    pub data_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ImageSizeSettings {
    pub cache_path: PathBuf,
    pub ttl: Duration,
    pub timeout: Duration,
    pub concurrency: NonZeroU32,
    pub data_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ThumbHashSettings {
    pub cache_path: PathBuf,
    pub ttl: Duration,
    pub timeout: Duration,
    pub concurrency: NonZeroU32,
    pub data_file: PathBuf,
}

impl LinkCardSettings {
    /// Whether a URL's host passes the include/exclude domain filters.
    /// Exclusion wins over inclusion; an empty include list admits every
    /// host. A domain matches itself and any subdomain.
    pub fn domain_allowed(&self, host: &str) -> bool {
        fn matches(host: &str, domain: &str) -> bool {
            host == domain
                || (host.len() > domain.len()
                    && host.ends_with(domain)
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        }
        let host = host.to_ascii_lowercase();
        if self.exclude_domains.iter().any(|d| matches(&host, d)) {
            return false;
        }
        self.include_domains.is_empty() || self.include_domains.iter().any(|d| matches(&host, d))
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("BREZZA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Warm(args) => {
            raw.apply_logging_overrides(&args.logging);
            raw.apply_fetch_overrides(args.kind, &args.overrides);
        }
        Command::Clear(args) => raw.apply_logging_overrides(&args.logging),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    link_card: RawFetchSettings,
    image_size: RawFetchSettings,
    thumbhash: RawFetchSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFetchSettings {
    cache_path: Option<PathBuf>,
    ttl_ms: Option<u64>,
    timeout_ms: Option<u64>,
    concurrency: Option<u32>,
    include_domains: Option<Vec<String>>,
    exclude_domains: Option<Vec<String>>,
    data_file: Option<PathBuf>,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_fetch_overrides(&mut self, kind: PipelineKind, overrides: &FetchOverrides) {
        let section = match kind {
            PipelineKind::LinkCard => &mut self.link_card,
            PipelineKind::ImageSize => &mut self.image_size,
            PipelineKind::Thumbhash => &mut self.thumbhash,
        };
        if let Some(value) = overrides.concurrency {
            section.concurrency = Some(value);
        }
        if let Some(value) = overrides.timeout_ms {
            section.timeout_ms = Some(value);
        }
        if let Some(path) = overrides.cache_path.as_ref() {
            section.cache_path = Some(path.clone());
        }
    }
}

/// Per-pipeline defaults used when the file and environment are silent.
struct FetchDefaults {
    key: &'static str,
    cache_path: &'static str,
    ttl_ms: u64,
    timeout_ms: u64,
    concurrency: u32,
    data_file: &'static str,
}

const LINK_CARD_DEFAULTS: FetchDefaults = FetchDefaults {
    key: "link_card",
    cache_path: DEFAULT_LINK_CARD_CACHE_PATH,
    ttl_ms: DEFAULT_LINK_CARD_TTL_MS,
    timeout_ms: DEFAULT_LINK_CARD_TIMEOUT_MS,
    concurrency: DEFAULT_LINK_CARD_CONCURRENCY,
    data_file: DEFAULT_LINK_CARD_DATA_FILE,
};

const IMAGE_SIZE_DEFAULTS: FetchDefaults = FetchDefaults {
    key: "image_size",
    cache_path: DEFAULT_IMAGE_SIZE_CACHE_PATH,
    ttl_ms: DEFAULT_IMAGE_SIZE_TTL_MS,
    timeout_ms: DEFAULT_IMAGE_SIZE_TIMEOUT_MS,
    concurrency: DEFAULT_IMAGE_SIZE_CONCURRENCY,
    data_file: DEFAULT_IMAGE_SIZE_DATA_FILE,
};

const THUMBHASH_DEFAULTS: FetchDefaults = FetchDefaults {
    key: "thumbhash",
    cache_path: DEFAULT_THUMBHASH_CACHE_PATH,
    ttl_ms: DEFAULT_THUMBHASH_TTL_MS,
    timeout_ms: DEFAULT_THUMBHASH_TIMEOUT_MS,
    concurrency: DEFAULT_THUMBHASH_CONCURRENCY,
    data_file: DEFAULT_THUMBHASH_DATA_FILE,
};

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            link_card,
            image_size,
            thumbhash,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let link_card = build_link_card_settings(link_card)?;
        let image_size = build_image_size_settings(image_size)?;
        let thumbhash = build_thumbhash_settings(thumbhash)?;

        Ok(Self {
            logging,
            link_card,
            image_size,
            thumbhash,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

struct ResolvedFetch {
    cache_path: PathBuf,
    ttl: Duration,
    timeout: Duration,
    concurrency: NonZeroU32,
    data_file: PathBuf,
}

fn resolve_fetch_settings(
    raw: &RawFetchSettings,
    defaults: &FetchDefaults,
) -> Result<ResolvedFetch, LoadError> {
    let cache_path = raw
        .cache_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(defaults.cache_path));
    if cache_path.as_os_str().is_empty() {
        return Err(LoadError::Invalid {
            key: defaults.key,
            reason: "cache_path must not be empty".to_string(),
        });
    }

    let ttl_ms = raw.ttl_ms.unwrap_or(defaults.ttl_ms);
    if ttl_ms == 0 {
        return Err(LoadError::Invalid {
            key: defaults.key,
            reason: "ttl_ms must be greater than zero".to_string(),
        });
    }

    let timeout_ms = raw.timeout_ms.unwrap_or(defaults.timeout_ms);
    if timeout_ms == 0 {
        return Err(LoadError::Invalid {
            key: defaults.key,
            reason: "timeout_ms must be greater than zero".to_string(),
        });
    }

    let concurrency = NonZeroU32::new(raw.concurrency.unwrap_or(defaults.concurrency)).ok_or(
        LoadError::Invalid {
            key: defaults.key,
            reason: "concurrency must be greater than zero".to_string(),
        },
    )?;

    let data_file = raw
        .data_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(defaults.data_file));

    Ok(ResolvedFetch {
        cache_path,
        ttl: Duration::from_millis(ttl_ms),
        timeout: Duration::from_millis(timeout_ms),
        concurrency,
        data_file,
    })
}

fn normalize_domains(domains: Option<Vec<String>>) -> Vec<String> {
    domains
        .unwrap_or_default()
        .into_iter()
        .filter_map(|domain| {
            let trimmed = domain.trim().to_ascii_lowercase();
            (!trimmed.is_empty()).then_some(trimmed)
        })
        .collect()
}

fn build_link_card_settings(raw: RawFetchSettings) -> Result<LinkCardSettings, LoadError> {
    let include_domains = normalize_domains(raw.include_domains.clone());
    let exclude_domains = normalize_domains(raw.exclude_domains.clone());
    let resolved = resolve_fetch_settings(&raw, &LINK_CARD_DEFAULTS)?;
    Ok(LinkCardSettings {
        cache_path: resolved.cache_path,
        ttl: resolved.ttl,
        timeout: resolved.timeout,
        concurrency: resolved.concurrency,
        include_domains,
        exclude_domains,
        data_file: resolved.data_file,
    })
}

fn build_image_size_settings(raw: RawFetchSettings) -> Result<ImageSizeSettings, LoadError> {
    let resolved = resolve_fetch_settings(&raw, &IMAGE_SIZE_DEFAULTS)?;
    Ok(ImageSizeSettings {
        cache_path: resolved.cache_path,
        ttl: resolved.ttl,
        timeout: resolved.timeout,
        concurrency: resolved.concurrency,
        data_file: resolved.data_file,
    })
}

fn build_thumbhash_settings(raw: RawFetchSettings) -> Result<ThumbHashSettings, LoadError> {
    let resolved = resolve_fetch_settings(&raw, &THUMBHASH_DEFAULTS)?;
    Ok(ThumbHashSettings {
        cache_path: resolved.cache_path,
        ttl: resolved.ttl,
        timeout: resolved.timeout,
        concurrency: resolved.concurrency,
        data_file: resolved.data_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
        assert_eq!(
            settings.link_card.ttl,
            Duration::from_millis(DEFAULT_LINK_CARD_TTL_MS)
        );
        assert_eq!(settings.link_card.concurrency.get(), 5);
        assert_eq!(settings.image_size.concurrency.get(), 5);
        assert_eq!(settings.thumbhash.concurrency.get(), 3);
        assert_eq!(
            settings.thumbhash.timeout,
            Duration::from_millis(DEFAULT_THUMBHASH_TIMEOUT_MS)
        );
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.thumbhash.concurrency = Some(8);
        raw.logging.level = Some("info".to_string());

        let overrides = FetchOverrides {
            concurrency: Some(2),
            timeout_ms: Some(500),
            ..Default::default()
        };
        raw.apply_fetch_overrides(PipelineKind::Thumbhash, &overrides);
        raw.apply_logging_overrides(&LoggingOverrides {
            log_level: Some("debug".to_string()),
            log_json: Some(true),
        });

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.thumbhash.concurrency.get(), 2);
        assert_eq!(settings.thumbhash.timeout, Duration::from_millis(500));
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn overrides_touch_only_the_selected_pipeline() {
        let mut raw = RawSettings::default();
        let overrides = FetchOverrides {
            concurrency: Some(1),
            ..Default::default()
        };
        raw.apply_fetch_overrides(PipelineKind::ImageSize, &overrides);

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.image_size.concurrency.get(), 1);
        assert_eq!(settings.link_card.concurrency.get(), 5);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut raw = RawSettings::default();
        raw.link_card.concurrency = Some(0);
        let err = Settings::from_raw(raw).expect_err("invalid settings");
        assert!(matches!(err, LoadError::Invalid { key: "link_card", .. }));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mut raw = RawSettings::default();
        raw.image_size.ttl_ms = Some(0);
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn domain_filters_normalize_case_and_whitespace() {
        let mut raw = RawSettings::default();
        raw.link_card.exclude_domains = Some(vec![" Tracker.example ".to_string(), String::new()]);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.link_card.exclude_domains, vec!["tracker.example"]);
    }

    #[test]
    fn domain_allowed_exclusion_wins() {
        let settings = LinkCardSettings {
            cache_path: PathBuf::from(".brezza/link-card"),
            ttl: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            concurrency: NonZeroU32::new(1).expect("non-zero"),
            include_domains: vec!["example.com".to_string()],
            exclude_domains: vec!["private.example.com".to_string()],
            data_file: PathBuf::from("data/link-cards.json"),
        };
        assert!(settings.domain_allowed("example.com"));
        assert!(settings.domain_allowed("blog.example.com"));
        assert!(!settings.domain_allowed("private.example.com"));
        assert!(!settings.domain_allowed("deep.private.example.com"));
        assert!(!settings.domain_allowed("other.org"));
        // Suffix match must respect label boundaries.
        assert!(!settings.domain_allowed("notexample.com"));
    }

    #[test]
    fn empty_include_list_admits_all_hosts() {
        let settings = LinkCardSettings {
            cache_path: PathBuf::from(".brezza/link-card"),
            ttl: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            concurrency: NonZeroU32::new(1).expect("non-zero"),
            include_domains: Vec::new(),
            exclude_domains: Vec::new(),
            data_file: PathBuf::from("data/link-cards.json"),
        };
        assert!(settings.domain_allowed("anything.example"));
    }

    #[test]
    fn parse_warm_arguments() {
        let args = CliArgs::parse_from([
            "brezza",
            "warm",
            "--kind",
            "link-card",
            "--input",
            "urls.txt",
            "--concurrency",
            "2",
        ]);
        match args.command {
            Command::Warm(warm) => {
                assert_eq!(warm.kind, PipelineKind::LinkCard);
                assert_eq!(warm.input, PathBuf::from("urls.txt"));
                assert!(warm.output.is_none());
                assert_eq!(warm.overrides.concurrency, Some(2));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parse_clear_without_kind() {
        let args = CliArgs::parse_from(["brezza", "clear"]);
        match args.command {
            Command::Clear(clear) => assert!(clear.kind.is_none()),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
