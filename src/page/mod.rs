//! Single-page processing.
//!
//! Decides the static-vs-dynamic path for one URL, fetches the HTML, runs
//! the rewriter, persists the page file into the mirrored tree and returns
//! the rewritten document for link discovery.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use reqwest::Client;
use tokio::sync::watch;
use url::Url;

use crate::assets::AssetDownloader;
use crate::engine::browser::BrowserSlot;
use crate::error::ArchiveError;
use crate::rewriter::HtmlRewriter;
use crate::utils::constants::{CHROME_USER_AGENT, DYNAMIC_CONTENT_MARKERS};

/// Bound an async page operation so a wedged navigation cannot hang a
/// worker forever.
async fn with_page_timeout<F, T>(operation: F, timeout_secs: u64, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(timeout_secs), operation).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "{operation_name} timeout after {timeout_secs} seconds"
        )),
    }
}

/// Result of processing one page.
#[derive(Debug)]
pub struct PageOutcome {
    /// Path of the written file relative to the archive root.
    pub relative_path: PathBuf,
    /// The rewritten document, for link discovery.
    pub html: String,
    /// Whether the static fast path served this page.
    pub was_static: bool,
    /// Absolute same-origin links found during rewriting.
    pub page_links: Vec<String>,
}

/// Processes pages for one crawl; shared by every worker.
pub struct PageProcessor {
    client: Client,
    assets: Arc<AssetDownloader>,
    output_dir: PathBuf,
    base_url: String,
    remove_webflow_badge: bool,
    try_static_first: bool,
    page_load_timeout_secs: u64,
}

impl PageProcessor {
    pub fn new(
        client: Client,
        assets: Arc<AssetDownloader>,
        output_dir: PathBuf,
        base_url: String,
        remove_webflow_badge: bool,
        try_static_first: bool,
    ) -> Self {
        Self {
            client,
            assets,
            output_dir,
            base_url,
            remove_webflow_badge,
            try_static_first,
            page_load_timeout_secs: 30,
        }
    }

    /// Process one URL. `should_abort` is polled before navigation and again
    /// before the result is written; an observed cancellation raises
    /// [`ArchiveError::Cancelled`].
    pub async fn process(
        &self,
        url: &str,
        slot: &BrowserSlot,
        should_abort: &watch::Receiver<bool>,
    ) -> Result<PageOutcome> {
        if *should_abort.borrow() {
            return Err(ArchiveError::Cancelled.into());
        }

        let parsed = Url::parse(url).with_context(|| format!("invalid page URL {url}"))?;
        let relative_path = page_relative_path(&parsed);

        if self.try_static_first {
            match self.fetch_static(url).await {
                Ok(html) if !looks_dynamic(&html) => {
                    debug!("Static fast path: {url}");
                    return self
                        .finish(url, html, relative_path, true, should_abort)
                        .await;
                }
                Ok(_) => debug!("Dynamic markers present, using browser: {url}"),
                Err(e) => debug!("Static fetch failed for {url}, using browser: {e:#}"),
            }
        }

        let html = self.fetch_dynamic(url, slot).await?;
        self.finish(url, html, relative_path, false, should_abort)
            .await
    }

    async fn finish(
        &self,
        url: &str,
        html: String,
        relative_path: PathBuf,
        was_static: bool,
        should_abort: &watch::Receiver<bool>,
    ) -> Result<PageOutcome> {
        let rewriter = HtmlRewriter::new(
            Arc::clone(&self.assets),
            &self.base_url,
            self.remove_webflow_badge,
        )?;
        let outcome = rewriter.rewrite(&html, url).await?;

        if *should_abort.borrow() {
            return Err(ArchiveError::Cancelled.into());
        }

        let target = self.output_dir.join(&relative_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, &outcome.html)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;

        Ok(PageOutcome {
            relative_path,
            html: outcome.html,
            was_static,
            page_links: outcome.page_links,
        })
    }

    /// Direct HTTP fetch for the static fast path.
    async fn fetch_static(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", CHROME_USER_AGENT)
            .header("Accept", "text/html,application/xhtml+xml")
            .timeout(Duration::from_secs(self.page_load_timeout_secs))
            .send()
            .await
            .context("static fetch failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {status}");
        }
        response.text().await.context("failed to read page body")
    }

    /// Render the page in the slot's browser and serialize the DOM.
    async fn fetch_dynamic(&self, url: &str, slot: &BrowserSlot) -> Result<String> {
        let browser = slot.browser().await?;

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open page")?;

        let navigation = with_page_timeout(
            async {
                page.goto(url).await.map_err(|e| anyhow::anyhow!("{e}"))?;
                page.wait_for_navigation()
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                Ok(())
            },
            self.page_load_timeout_secs,
            "Page navigation",
        )
        .await;

        if let Err(e) = navigation {
            if let Err(close_err) = page.close().await {
                debug!("Page close after failed navigation: {close_err}");
            }
            return Err(e);
        }

        let html = with_page_timeout(
            async { page.content().await.map_err(|e| anyhow::anyhow!("{e}")) },
            self.page_load_timeout_secs,
            "DOM serialization",
        )
        .await;

        if let Err(e) = page.close().await {
            debug!("Page close failed for {url}: {e}");
        }

        html.with_context(|| format!("failed to serialize {url}"))
    }
}

/// True when a directly-fetched document needs a browser to render.
pub fn looks_dynamic(html: &str) -> bool {
    DYNAMIC_CONTENT_MARKERS
        .iter()
        .any(|marker| html.contains(marker))
}

/// Derive the mirrored file path for a page URL.
///
/// Root maps to `index.html`; a trailing slash or extensionless path gets
/// `<path>/index.html`; anything else mirrors the path literally. Directory
/// components are sanitized so a hostile path can never escape the root.
pub fn page_relative_path(url: &Url) -> PathBuf {
    let raw_path = url.path();
    if raw_path == "/" || raw_path.is_empty() {
        return PathBuf::from("index.html");
    }

    let segments: Vec<String> = raw_path
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(|s| {
            sanitize_filename::sanitize(
                urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.to_string()),
            )
        })
        .filter(|s| !s.is_empty())
        .collect();

    if segments.is_empty() {
        return PathBuf::from("index.html");
    }

    let mut path = PathBuf::new();
    let trailing_slash = raw_path.ends_with('/');
    let last_has_extension = segments
        .last()
        .map(|s| s.rsplit_once('.').is_some_and(|(stem, ext)| {
            !stem.is_empty() && !ext.is_empty() && ext.len() <= 8
        }))
        .unwrap_or(false);

    for segment in &segments {
        path.push(segment);
    }
    if trailing_slash || !last_has_extension {
        path.push("index.html");
    }
    path
}
