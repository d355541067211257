//! Asset pipeline behavior against a mock origin: CSS rewriting, chunk
//! stockpiling, blacklist gating, dedup and the cross-crawl binary cache.

mod common;

use std::sync::Arc;

use sitevault::{AssetCache, AssetCategory, AssetDownloader, Blacklist};
use tempfile::TempDir;

#[tokio::test]
async fn css_references_are_downloaded_and_rewritten() {
    let mut server = mockito::Server::new_async().await;
    let out = TempDir::new().expect("tempdir");

    server
        .mock("GET", "/css/site.css")
        .with_status(200)
        .with_header("content-type", "text/css")
        .with_body(r#".hero { background: url("/img/a.png"); } .logo { background: url('/img/b.png'); }"#)
        .create_async()
        .await;
    let img_a = server
        .mock("GET", "/img/a.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body([0x89u8, 0x50, 0x4e, 0x47].as_slice())
        .create_async()
        .await;
    let img_b = server
        .mock("GET", "/img/b.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body([0x89u8, 0x50, 0x4e, 0x47].as_slice())
        .create_async()
        .await;

    let dl = common::downloader(out.path(), &server.url(), &[]);
    let local = dl
        .download_asset(&format!("{}/css/site.css", server.url()), AssetCategory::Css)
        .await;

    assert!(local.starts_with("/css/"), "got {local}");
    img_a.assert_async().await;
    img_b.assert_async().await;

    let written = std::fs::read_to_string(
        out.path().join(local.trim_start_matches('/')),
    )
    .expect("rewritten css on disk");
    assert!(written.contains(r#"url("/images/a-"#), "css: {written}");
    assert!(written.contains(r#"url('/images/b-"#), "quote style preserved: {written}");
    assert!(!written.contains("/img/a.png"), "original reference replaced");
}

#[tokio::test]
async fn chunk_manifest_chunks_are_stockpiled_verbatim() {
    let mut server = mockito::Server::new_async().await;
    let out = TempDir::new().expect("tempdir");

    let app_js = r#"var r={};r.u=e=>"main.achunk."+{0:"abc",1:"def"}[e]+".js";export default r;"#;
    server
        .mock("GET", "/js/app.js")
        .with_status(200)
        .with_header("content-type", "application/javascript")
        .with_body(app_js)
        .create_async()
        .await;
    let chunk_abc = server
        .mock("GET", "/js/main.achunk.abc.js")
        .with_status(200)
        .with_body("console.log('abc')")
        .create_async()
        .await;
    let chunk_def = server
        .mock("GET", "/js/main.achunk.def.js")
        .with_status(200)
        .with_body("console.log('def')")
        .create_async()
        .await;

    let dl = common::downloader(out.path(), &server.url(), &[]);
    let local = dl
        .download_asset(&format!("{}/js/app.js", server.url()), AssetCategory::Js)
        .await;

    chunk_abc.assert_async().await;
    chunk_def.assert_async().await;

    // Chunks keep their exact basenames so the runtime loader finds them.
    assert!(out.path().join("js/main.achunk.abc.js").exists());
    assert!(out.path().join("js/main.achunk.def.js").exists());

    // The manifest function itself is not rewritten.
    let stored = std::fs::read_to_string(out.path().join(local.trim_start_matches('/')))
        .expect("stored js");
    assert!(stored.contains(r#"r.u=e=>"main.achunk."+{0:"abc",1:"def"}[e]+".js""#));
}

#[tokio::test]
async fn blacklisted_urls_are_left_untouched_and_never_fetched() {
    let mut server = mockito::Server::new_async().await;
    let out = TempDir::new().expect("tempdir");

    let never = server
        .mock("GET", "/assets/x.js")
        .expect(0)
        .create_async()
        .await;

    let rule = format!("{}/assets/*", server.url());
    let dl = common::downloader(out.path(), &server.url(), &[rule.as_str()]);

    let url = format!("{}/assets/x.js?v=1", server.url());
    let result = dl.download_asset(&url, AssetCategory::Js).await;

    assert_eq!(result, url, "blacklisted reference stays as-is");
    never.assert_async().await;
}

#[tokio::test]
async fn concurrent_requests_fetch_once() {
    let mut server = mockito::Server::new_async().await;
    let out = TempDir::new().expect("tempdir");

    let mock = server
        .mock("GET", "/img/logo.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body("png")
        .expect(1)
        .create_async()
        .await;

    let dl = common::downloader(out.path(), &server.url(), &[]);
    let url = format!("{}/img/logo.png", server.url());

    let (a, b, c) = tokio::join!(
        dl.download_asset(&url, AssetCategory::Image),
        dl.download_asset(&url, AssetCategory::Image),
        dl.download_asset(&url, AssetCategory::Image),
    );

    assert_eq!(a, b);
    assert_eq!(b, c);
    assert!(a.starts_with("/images/"));
    mock.assert_async().await;
}

#[tokio::test]
async fn warm_cache_serves_binary_assets_without_network() {
    let mut server = mockito::Server::new_async().await;
    let out_first = TempDir::new().expect("tempdir");
    let out_second = TempDir::new().expect("tempdir");
    let cache_dir = TempDir::new().expect("tempdir");

    let mock = server
        .mock("GET", "/img/photo.jpg")
        .with_status(200)
        .with_header("content-type", "image/jpeg")
        .with_body("jpeg-bytes")
        .expect(1)
        .create_async()
        .await;

    let cache = Arc::new(AssetCache::open(cache_dir.path(), "example.com").expect("cache"));
    let url = format!("{}/img/photo.jpg", server.url());

    // First crawl: network fetch, cache populated.
    let first = AssetDownloader::new(
        reqwest::Client::new(),
        out_first.path().to_path_buf(),
        &server.url(),
        Blacklist::default(),
        Some(Arc::clone(&cache)),
    )
    .expect("downloader");
    let path_one = first.download_asset(&url, AssetCategory::Image).await;
    assert!(path_one.starts_with("/images/"));

    // Second crawl: same URL comes from the cache, zero extra requests.
    let second = AssetDownloader::new(
        reqwest::Client::new(),
        out_second.path().to_path_buf(),
        &server.url(),
        Blacklist::default(),
        Some(Arc::clone(&cache)),
    )
    .expect("downloader");
    let path_two = second.download_asset(&url, AssetCategory::Image).await;
    assert_eq!(path_one, path_two);

    mock.assert_async().await;
    let stats = cache.stats();
    assert!(stats.hit_rate >= 0.5, "hit rate {} too low", stats.hit_rate);
    assert!(out_second
        .path()
        .join(path_two.trim_start_matches('/'))
        .exists());
}

#[tokio::test]
async fn failed_downloads_keep_the_original_reference() {
    let mut server = mockito::Server::new_async().await;
    let out = TempDir::new().expect("tempdir");

    server
        .mock("GET", "/img/missing.png")
        .with_status(404)
        .create_async()
        .await;

    let dl = common::downloader(out.path(), &server.url(), &[]);
    let url = format!("{}/img/missing.png", server.url());
    let result = dl.download_asset(&url, AssetCategory::Image).await;

    assert_eq!(result, url);
}
