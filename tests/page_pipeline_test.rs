//! Static-path page processing end to end: fetch, rewrite, mirror layout,
//! cancellation.

mod common;

use std::sync::Arc;

use sitevault::engine::browser::BrowserSlot;
use sitevault::page::PageProcessor;
use tempfile::TempDir;
use tokio::sync::watch;

fn processor(server: &mockito::Server, out: &TempDir) -> PageProcessor {
    let assets = common::downloader(out.path(), &server.url(), &[]);
    PageProcessor::new(
        reqwest::Client::new(),
        Arc::clone(&assets),
        out.path().to_path_buf(),
        server.url(),
        false,
        true,
    )
}

#[tokio::test]
async fn static_page_is_mirrored_and_rewritten() {
    let mut server = mockito::Server::new_async().await;
    let out = TempDir::new().expect("tempdir");

    server
        .mock("GET", "/pricing")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(common::page_html(
            r#"<link rel="stylesheet" href="/css/site.css">"#,
            r#"<img src="/img/hero.png"><a href="/about">About</a><a href="https://elsewhere.example/x">Out</a>"#,
        ))
        .create_async()
        .await;
    server
        .mock("GET", "/css/site.css")
        .with_status(200)
        .with_header("content-type", "text/css")
        .with_body("body { margin: 0; }")
        .create_async()
        .await;
    server
        .mock("GET", "/img/hero.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body("png")
        .create_async()
        .await;

    let processor = processor(&server, &out);
    let slot = BrowserSlot::new(0, true);
    let (_tx, abort) = watch::channel(false);

    let outcome = processor
        .process(&format!("{}/pricing", server.url()), &slot, &abort)
        .await
        .expect("process");

    assert!(outcome.was_static);
    assert_eq!(
        outcome.relative_path.to_string_lossy().replace('\\', "/"),
        "pricing/index.html"
    );

    let written = std::fs::read_to_string(out.path().join("pricing/index.html"))
        .expect("page on disk");
    assert!(written.contains("/css/site-"), "stylesheet rewritten: {written}");
    assert!(written.contains("/images/hero-"), "image rewritten: {written}");
    assert!(written.contains(r#"href="/about""#), "same-origin link localized");
    assert!(
        written.contains("https://elsewhere.example/x"),
        "off-origin link untouched"
    );

    // Discovered links come back absolute for the frontier.
    assert!(outcome
        .page_links
        .iter()
        .any(|l| l == &format!("{}/about", server.url())));
}

#[tokio::test]
async fn abort_raises_the_cancellation_error() {
    let server = mockito::Server::new_async().await;
    let out = TempDir::new().expect("tempdir");

    let processor = processor(&server, &out);
    let slot = BrowserSlot::new(0, true);
    let (tx, abort) = watch::channel(false);
    tx.send(true).expect("flip abort");

    let err = processor
        .process(&format!("{}/", server.url()), &slot, &abort)
        .await
        .expect_err("must abort");
    assert!(
        format!("{err:#}").contains("Crawl cancelled by request."),
        "got {err:#}"
    );
}

#[tokio::test]
async fn root_page_lands_at_index_html() {
    let mut server = mockito::Server::new_async().await;
    let out = TempDir::new().expect("tempdir");

    server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(common::page_html("", "<h1>Home</h1>"))
        .create_async()
        .await;

    let processor = processor(&server, &out);
    let slot = BrowserSlot::new(0, true);
    let (_tx, abort) = watch::channel(false);

    let outcome = processor
        .process(&format!("{}/", server.url()), &slot, &abort)
        .await
        .expect("process");

    assert_eq!(outcome.relative_path.to_string_lossy(), "index.html");
    assert!(out.path().join("index.html").exists());
}
