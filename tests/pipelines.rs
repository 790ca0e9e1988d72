#![deny(clippy::all, clippy::pedantic)]

use std::io::Cursor;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use brezza::pipeline::{
    HashStrategy, ImageSizeOptions, ImageSizePipeline, OpenGraphOptions, OpenGraphPipeline,
    ThumbHashOptions, ThumbHashPipeline,
};
use httpmock::MockServer;
use image::{ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([180, 40, 40, 255]));
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageFormat::Png)
        .expect("png encodes");
    bytes.into_inner()
}

fn og_pipeline(dir: &TempDir) -> OpenGraphPipeline {
    OpenGraphPipeline::new(OpenGraphOptions {
        cache_path: dir.path().join("link-card"),
        ttl: Duration::from_secs(3600),
        timeout: Duration::from_secs(5),
        concurrency: 2,
    })
    .expect("pipeline builds")
}

fn size_pipeline(dir: &TempDir) -> ImageSizePipeline {
    ImageSizePipeline::new(ImageSizeOptions {
        cache_path: dir.path().join("image-sizes.json"),
        ttl: Duration::from_secs(3600),
        timeout: Duration::from_secs(5),
        concurrency: 2,
    })
    .expect("pipeline builds")
}

fn thumb_options(dir: &TempDir) -> ThumbHashOptions {
    ThumbHashOptions {
        cache_path: dir.path().join("thumbhashes.json"),
        ttl: Duration::from_secs(3600),
        timeout: Duration::from_secs(5),
        concurrency: 2,
    }
}

#[tokio::test]
async fn open_graph_success_is_cached() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/post");
            then.status(200)
                .header("content-type", "text/html; charset=utf-8")
                .body(
                    r#"<html><head>
                        <meta property="og:title" content="Hello">
                        <meta property="og:image" content="https://cdn.example/cover.png">
                    </head><body></body></html>"#,
                );
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = og_pipeline(&dir);
    let url = server.url("/post");

    let first = pipeline.fetch(&url).await.expect("metadata");
    assert_eq!(first.title.as_deref(), Some("Hello"));
    assert_eq!(first.image.as_deref(), Some("https://cdn.example/cover.png"));
    assert_eq!(first.url.as_deref(), Some(url.as_str()));

    let second = pipeline.fetch(&url).await.expect("cached metadata");
    assert_eq!(second, first);
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn open_graph_failure_is_not_cached() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/gone");
            then.status(404).body("nope");
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = og_pipeline(&dir);
    let url = server.url("/gone");

    assert!(pipeline.fetch(&url).await.is_none());
    assert!(pipeline.fetch(&url).await.is_none());
    // Both calls hit the network: failures never enter the cache.
    assert_eq!(mock.hits_async().await, 2);
}

#[tokio::test]
async fn open_graph_rejects_non_html() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"title":"not html"}"#);
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = og_pipeline(&dir);
    assert!(pipeline.fetch(&server.url("/api")).await.is_none());
}

#[tokio::test]
async fn open_graph_synthesizes_and_caches_bare_pages() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/bare");
            then.status(200)
                .header("content-type", "text/html")
                .body("<html><head></head><body>nothing here</body></html>");
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = og_pipeline(&dir);
    let url = server.url("/bare");

    let data = pipeline.fetch(&url).await.expect("synthetic record");
    assert_eq!(data.title.as_deref(), Some("127.0.0.1"));
    assert_eq!(data.url.as_deref(), Some(url.as_str()));
    assert!(data.description.is_none());

    // The synthetic record is a positive result and is cached.
    pipeline.fetch(&url).await.expect("cached record");
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn open_graph_batch_is_complete() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/ok");
            then.status(200)
                .header("content-type", "text/html")
                .body(r#"<head><meta property="og:title" content="Ok"></head>"#);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/broken");
            then.status(500);
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = og_pipeline(&dir);
    let urls = vec![server.url("/ok"), server.url("/broken"), "not-a-url".to_string()];

    let results = pipeline.batch(&urls).await;
    assert_eq!(results.len(), 3);
    assert!(results[&urls[0]].is_some());
    assert!(results[&urls[1]].is_none());
    assert!(results[&urls[2]].is_none());
}

#[tokio::test]
async fn image_size_probes_dimensions() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/photo.png");
            then.status(200)
                .header("content-type", "image/png")
                .body(png_bytes(640, 480));
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = size_pipeline(&dir);
    let url = server.url("/photo.png");

    let dims = pipeline.fetch(&url).await.expect("dimensions");
    assert_eq!(dims.width, 640);
    assert_eq!(dims.height, 480);
    assert_eq!(dims.aspect_ratio, "4/3");

    pipeline.fetch(&url).await.expect("cached dimensions");
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn image_size_rejects_non_images() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/page");
            then.status(200)
                .header("content-type", "text/html")
                .body("<html>not an image</html>");
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = size_pipeline(&dir);
    assert!(pipeline.fetch(&server.url("/page")).await.is_none());
}

#[tokio::test]
async fn image_size_gives_up_at_the_byte_budget() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/huge.bin");
            // Undecodable body well past the byte budget; the prober must
            // stop reading instead of buffering the whole response.
            then.status(200)
                .header("content-type", "application/octet-stream")
                .body(vec![0u8; 256 * 1024]);
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = size_pipeline(&dir);
    assert!(pipeline.fetch(&server.url("/huge.bin")).await.is_none());
}

#[tokio::test]
async fn thumbhash_placeholder_strategy_produces_inline_bmp() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/wide.png");
            then.status(200)
                .header("content-type", "image/png")
                .body(png_bytes(100, 50));
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline =
        ThumbHashPipeline::with_strategy(thumb_options(&dir), HashStrategy::Placeholder)
            .expect("pipeline builds");

    let result = pipeline
        .generate(&server.url("/wide.png"))
        .await
        .expect("thumbhash result");
    assert_eq!(result.width, 100);
    assert_eq!(result.height, 50);
    assert!((result.aspect_ratio - 2.0).abs() < f64::EPSILON);
    assert!(result.data_url.starts_with("data:image/bmp;base64,"));
    assert!(
        BASE64_STANDARD.decode(&result.thumbhash).is_ok(),
        "thumbhash is valid base64"
    );
    assert!(result.date.is_none());
    assert!(result.location.is_none());
}

#[cfg(feature = "decode")]
#[tokio::test]
async fn thumbhash_pixel_strategy_is_cached() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/photo.png");
            then.status(200)
                .header("content-type", "image/png")
                .body(png_bytes(80, 60));
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = ThumbHashPipeline::new(thumb_options(&dir)).expect("pipeline builds");
    let url = server.url("/photo.png");

    let first = pipeline.generate(&url).await.expect("thumbhash result");
    assert!(!first.thumbhash.is_empty());

    let second = pipeline.generate(&url).await.expect("cached result");
    assert_eq!(second, first);
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn thumbhash_failure_is_not_cached() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/broken");
            then.status(200)
                .header("content-type", "image/png")
                .body("definitely not pixels");
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = ThumbHashPipeline::new(thumb_options(&dir)).expect("pipeline builds");
    let url = server.url("/broken");

    assert!(pipeline.generate(&url).await.is_none());
    assert!(pipeline.generate(&url).await.is_none());
    assert_eq!(mock.hits_async().await, 2);
}

#[tokio::test]
async fn clear_cache_forces_a_refetch() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/post");
            then.status(200)
                .header("content-type", "text/html")
                .body(r#"<head><meta property="og:title" content="T"></head>"#);
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let pipeline = og_pipeline(&dir);
    let url = server.url("/post");

    pipeline.fetch(&url).await.expect("metadata");
    pipeline.clear_cache();
    pipeline.fetch(&url).await.expect("refetched metadata");
    assert_eq!(mock.hits_async().await, 2);
}

#[tokio::test]
async fn purge_cache_drops_entries_without_building_a_pipeline() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/photo.png");
            then.status(200)
                .header("content-type", "image/png")
                .body(png_bytes(100, 100));
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let cache_path = dir.path().join("image-sizes.json");
    let options = || ImageSizeOptions {
        cache_path: cache_path.clone(),
        ttl: Duration::from_secs(3600),
        timeout: Duration::from_secs(5),
        concurrency: 2,
    };
    let url = server.url("/photo.png");

    let pipeline = ImageSizePipeline::new(options()).expect("pipeline builds");
    pipeline.fetch(&url).await.expect("dimensions");
    assert!(cache_path.exists());

    ImageSizePipeline::purge_cache(options());
    assert!(!cache_path.exists());

    // A new pipeline sees the purged store and has to refetch.
    let fresh = ImageSizePipeline::new(options()).expect("pipeline builds");
    fresh.fetch(&url).await.expect("refetched dimensions");
    assert_eq!(mock.hits_async().await, 2);
}
