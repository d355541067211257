//! Per-crawl options.
//!
//! `CrawlOptions` is an immutable snapshot handed to the crawl engine; it is
//! derived from a persisted site record plus global settings and never reads
//! the database itself.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Options for one crawl of one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlOptions {
    /// Root URL of the site being archived.
    pub(crate) base_url: String,

    /// Output directory the archive tree is written into.
    ///
    /// **INVARIANT:** Always an absolute path (normalized in the builder).
    pub(crate) output_dir: PathBuf,

    /// Requested worker concurrency (clamped 1–30).
    pub(crate) concurrency: usize,

    /// Optional cap on the frontier after exclude filtering.
    pub(crate) max_pages: Option<usize>,

    /// Regex patterns filtering sitemap URLs out of the frontier.
    pub(crate) exclude_patterns: Vec<String>,

    /// Compiled form of `exclude_patterns`; built once so the hot path never
    /// compiles a regex.
    #[serde(skip)]
    pub(crate) exclude_patterns_compiled: Vec<regex::Regex>,

    /// Merged download blacklist rules (per-site rules plus the global list).
    pub(crate) download_blacklist: Vec<String>,

    /// Strip the Webflow badge markup after rewriting.
    pub(crate) remove_webflow_badge: bool,

    /// Optional path to a redirects CSV lifted into the output config.
    pub(crate) redirects_csv: Option<PathBuf>,

    /// Continue from the on-disk state file, skipping already-succeeded URLs.
    pub(crate) resume: bool,

    /// Re-crawl only the URLs recorded as failed in the state file.
    pub(crate) retry_failed: bool,

    /// Restrict the frontier to sitemap URLs (no link discovery).
    pub(crate) sitemap_only: bool,

    /// Append same-origin links found in rewritten pages to the frontier.
    pub(crate) discover_links: bool,

    /// Attempt a direct HTTP fetch before falling back to the browser.
    pub(crate) try_static_first: bool,

    /// Run browsers headless. Only ever disabled when debugging locally.
    pub(crate) headless: bool,
}

impl CrawlOptions {
    pub fn builder() -> CrawlOptionsBuilder {
        CrawlOptionsBuilder::default()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn max_pages(&self) -> Option<usize> {
        self.max_pages
    }

    pub fn exclude_patterns_compiled(&self) -> &[regex::Regex] {
        &self.exclude_patterns_compiled
    }

    pub fn download_blacklist(&self) -> &[String] {
        &self.download_blacklist
    }

    pub fn remove_webflow_badge(&self) -> bool {
        self.remove_webflow_badge
    }

    pub fn redirects_csv(&self) -> Option<&PathBuf> {
        self.redirects_csv.as_ref()
    }

    pub fn resume(&self) -> bool {
        self.resume
    }

    pub fn retry_failed(&self) -> bool {
        self.retry_failed
    }

    pub fn sitemap_only(&self) -> bool {
        self.sitemap_only
    }

    pub fn discover_links(&self) -> bool {
        self.discover_links
    }

    pub fn try_static_first(&self) -> bool {
        self.try_static_first
    }

    pub fn headless(&self) -> bool {
        self.headless
    }
}

/// Builder for [`CrawlOptions`].
#[derive(Debug, Default)]
pub struct CrawlOptionsBuilder {
    base_url: Option<String>,
    output_dir: Option<PathBuf>,
    concurrency: Option<usize>,
    max_pages: Option<usize>,
    exclude_patterns: Vec<String>,
    download_blacklist: Vec<String>,
    remove_webflow_badge: bool,
    redirects_csv: Option<PathBuf>,
    resume: bool,
    retry_failed: bool,
    sitemap_only: bool,
    discover_links: bool,
    try_static_first: bool,
    headless: Option<bool>,
}

impl CrawlOptionsBuilder {
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    #[must_use]
    pub fn max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    #[must_use]
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    #[must_use]
    pub fn download_blacklist(mut self, rules: Vec<String>) -> Self {
        self.download_blacklist = rules;
        self
    }

    #[must_use]
    pub fn remove_webflow_badge(mut self, remove: bool) -> Self {
        self.remove_webflow_badge = remove;
        self
    }

    #[must_use]
    pub fn redirects_csv(mut self, path: Option<PathBuf>) -> Self {
        self.redirects_csv = path;
        self
    }

    #[must_use]
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    #[must_use]
    pub fn retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    #[must_use]
    pub fn sitemap_only(mut self, sitemap_only: bool) -> Self {
        self.sitemap_only = sitemap_only;
        self
    }

    #[must_use]
    pub fn discover_links(mut self, discover: bool) -> Self {
        self.discover_links = discover;
        self
    }

    #[must_use]
    pub fn try_static_first(mut self, try_static: bool) -> Self {
        self.try_static_first = try_static;
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = Some(headless);
        self
    }

    /// Validate and assemble the options.
    ///
    /// Compiles exclude patterns up front; an invalid pattern is a
    /// configuration error, not something to discover mid-crawl.
    pub fn build(self) -> anyhow::Result<CrawlOptions> {
        let base_url = self
            .base_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("base_url is required"))?;
        url::Url::parse(&base_url)
            .map_err(|e| anyhow::anyhow!("base_url is not a valid URL: {e}"))?;

        let output_dir = self
            .output_dir
            .ok_or_else(|| anyhow::anyhow!("output_dir is required"))?;
        let output_dir = if output_dir.is_absolute() {
            output_dir
        } else {
            std::env::current_dir()?.join(output_dir)
        };

        let concurrency = self.concurrency.unwrap_or(5).clamp(1, 30);

        let mut exclude_patterns_compiled = Vec::with_capacity(self.exclude_patterns.len());
        for pattern in &self.exclude_patterns {
            let compiled = regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid exclude pattern {pattern:?}: {e}"))?;
            exclude_patterns_compiled.push(compiled);
        }

        Ok(CrawlOptions {
            base_url,
            output_dir,
            concurrency,
            max_pages: self.max_pages,
            exclude_patterns: self.exclude_patterns,
            exclude_patterns_compiled,
            download_blacklist: self.download_blacklist,
            remove_webflow_badge: self.remove_webflow_badge,
            redirects_csv: self.redirects_csv,
            resume: self.resume,
            retry_failed: self.retry_failed,
            sitemap_only: self.sitemap_only,
            discover_links: self.discover_links,
            try_static_first: self.try_static_first,
            headless: self.headless.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_concurrency() {
        let opts = CrawlOptions::builder()
            .base_url("https://example.com")
            .output_dir("/tmp/out")
            .concurrency(500)
            .build()
            .expect("build");
        assert_eq!(opts.concurrency(), 30);
    }

    #[test]
    fn builder_rejects_bad_exclude_pattern() {
        let err = CrawlOptions::builder()
            .base_url("https://example.com")
            .output_dir("/tmp/out")
            .exclude_patterns(vec!["[unclosed".into()])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("invalid exclude pattern"));
    }

    #[test]
    fn builder_requires_base_url() {
        assert!(CrawlOptions::builder().output_dir("/tmp/out").build().is_err());
    }
}
