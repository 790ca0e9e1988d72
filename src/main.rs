use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    process,
};

use brezza::{
    config::{self, ClearArgs, CliArgs, Command, PipelineKind, WarmArgs},
    infra::{error::InfraError, telemetry},
    pipeline::{
        ImageSizeOptions, ImageSizePipeline, OpenGraphOptions, OpenGraphPipeline,
        ThumbHashOptions, ThumbHashPipeline,
    },
};
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("failed to read input `{path}`: {source}")]
    Input { path: PathBuf, source: io::Error },
    #[error("failed to write output `{path}`: {source}")]
    Output { path: PathBuf, source: io::Error },
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let cli = CliArgs::parse();
    let settings = config::load(&cli)?;
    telemetry::init(&settings.logging)?;

    match &cli.command {
        Command::Warm(args) => run_warm(&settings, args).await,
        Command::Clear(args) => {
            run_clear(&settings, args);
            Ok(())
        }
    }
}

async fn run_warm(settings: &config::Settings, args: &WarmArgs) -> Result<(), AppError> {
    let urls = read_url_list(&args.input)?;

    match args.kind {
        PipelineKind::LinkCard => {
            let urls = filter_link_card_urls(&settings.link_card, urls);
            let pipeline = OpenGraphPipeline::new(OpenGraphOptions::from(&settings.link_card))?;
            let results = pipeline.batch(&urls).await;
            let output = args.output.as_ref().unwrap_or(&settings.link_card.data_file);
            write_data_file(output, &results)?;
            summarize("link-card", &results, output);
        }
        PipelineKind::ImageSize => {
            let pipeline = ImageSizePipeline::new(ImageSizeOptions::from(&settings.image_size))?;
            let results = pipeline.batch(&urls).await;
            let output = args
                .output
                .as_ref()
                .unwrap_or(&settings.image_size.data_file);
            write_data_file(output, &results)?;
            summarize("image-size", &results, output);
        }
        PipelineKind::Thumbhash => {
            let pipeline = ThumbHashPipeline::new(ThumbHashOptions::from(&settings.thumbhash))?;
            let results = pipeline.batch(&urls).await;
            let output = args.output.as_ref().unwrap_or(&settings.thumbhash.data_file);
            write_data_file(output, &results)?;
            summarize("thumbhash", &results, output);
        }
    }
    Ok(())
}

/// Drop cache files only. Goes through the pipelines' purge paths rather
/// than their constructors so clearing never depends on an HTTP client.
fn run_clear(settings: &config::Settings, args: &ClearArgs) {
    let kinds: &[PipelineKind] = match args.kind {
        Some(kind) => &[kind],
        None => &[
            PipelineKind::LinkCard,
            PipelineKind::ImageSize,
            PipelineKind::Thumbhash,
        ],
    };
    for kind in kinds {
        match kind {
            PipelineKind::LinkCard => {
                OpenGraphPipeline::purge_cache(OpenGraphOptions::from(&settings.link_card));
            }
            PipelineKind::ImageSize => {
                ImageSizePipeline::purge_cache(ImageSizeOptions::from(&settings.image_size));
            }
            PipelineKind::Thumbhash => {
                ThumbHashPipeline::purge_cache(ThumbHashOptions::from(&settings.thumbhash));
            }
        }
    }
    info!(target: "brezza::clear", cleared = kinds.len(), "Caches cleared");
}

/// One URL per line; blank lines and `#` comments are skipped.
fn read_url_list(path: &Path) -> Result<Vec<String>, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|source| AppError::Input {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Drop URLs whose host fails the configured include/exclude filters, and
/// URLs with no parseable host at all.
fn filter_link_card_urls(
    settings: &brezza::config::LinkCardSettings,
    urls: Vec<String>,
) -> Vec<String> {
    urls.into_iter()
        .filter(|raw| {
            let host = url::Url::parse(raw)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string));
            match host {
                Some(host) if settings.domain_allowed(&host) => true,
                Some(host) => {
                    info!(target: "brezza::warm", url = raw, host, "Skipping filtered domain");
                    false
                }
                None => {
                    warn!(target: "brezza::warm", url = raw, "Skipping URL without a host");
                    false
                }
            }
        })
        .collect()
}

/// Write the keyed results as pretty JSON, sorted by URL for stable diffs.
fn write_data_file<T: Serialize>(
    path: &Path,
    results: &std::collections::HashMap<String, Option<T>>,
) -> Result<(), AppError> {
    let sorted: BTreeMap<&String, &Option<T>> = results.iter().collect();
    let json = serde_json::to_string_pretty(&sorted).map_err(|err| AppError::Output {
        path: path.to_path_buf(),
        source: io::Error::other(err),
    })?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| AppError::Output {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, json).map_err(|source| AppError::Output {
        path: path.to_path_buf(),
        source,
    })
}

fn summarize<T>(
    kind: &str,
    results: &std::collections::HashMap<String, Option<T>>,
    output: &Path,
) {
    let fetched = results.values().filter(|value| value.is_some()).count();
    let failed = results.len() - fetched;
    info!(
        target: "brezza::warm",
        kind,
        fetched,
        failed,
        output = %output.display(),
        "Warm completed"
    );
}
