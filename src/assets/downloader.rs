//! Deduplicated asset downloading.
//!
//! One `AssetDownloader` lives for the duration of a crawl. Every caller that
//! wants a local path for an external URL goes through [`download_asset`]:
//! the first caller fetches, classifies, rewrites nested references and
//! persists; concurrent and later callers get the first caller's result.
//! Failures degrade to returning the original URL so the page keeps its
//! absolute reference instead of breaking.
//!
//! [`download_asset`]: AssetDownloader::download_asset

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use futures::StreamExt;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use reqwest::Client;
use sha1::{Digest, Sha1};
use tokio::sync::OnceCell;
use url::Url;

use super::{css, js, AssetCategory, Blacklist};
use crate::asset_cache::{AssetCache, CacheStats};
use crate::utils::constants::{ALLOWED_CDN_HOSTS, CHROME_USER_AGENT, HOSTILE_DOMAINS};
use crate::utils::url_utils::{strip_fragment, url_basename, url_extension};
use crate::utils::slugify;

/// Upper bound on a single asset body. Oversized responses are abandoned and
/// the original URL kept in the page.
const ASSET_MAX_BYTES: usize = 64 * 1024 * 1024;

lazy_static! {
    /// Bundler chunk basenames (`main.achunk.abc123.js`, `vendor.chunk.9f.mjs`)
    /// whose runtime loader resolves them by exact name.
    static ref CHUNK_NAME_RE: Regex = Regex::new(r"^.+\.a?chunk\.[0-9a-fA-F]+\.[A-Za-z0-9]+$")
        .expect("hardcoded chunk name regex must compile");
}

/// Per-crawl asset downloader with at-most-once fetch semantics per URL.
pub struct AssetDownloader {
    client: Client,
    output_dir: PathBuf,
    base_url: Url,
    blacklist: Blacklist,
    cache: Option<Arc<AssetCache>>,
    resolved: DashMap<String, Arc<OnceCell<String>>>,
    /// CSS/JS URLs whose bodies are being rewritten right now. A nested
    /// reference back into this set (an `@import` cycle, scripts naming each
    /// other) must not wait on its own completion; it keeps the original URL.
    rewriting: DashSet<String>,
}

impl AssetDownloader {
    pub fn new(
        client: Client,
        output_dir: PathBuf,
        base_url: &str,
        blacklist: Blacklist,
        cache: Option<Arc<AssetCache>>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid base URL for asset downloader")?;
        Ok(Self {
            client,
            output_dir,
            base_url,
            blacklist,
            cache,
            resolved: DashMap::new(),
            rewriting: DashSet::new(),
        })
    }

    /// Whether `url` is a stylesheet/script currently being rewritten higher
    /// up the call chain.
    pub(crate) fn is_rewriting(&self, url: &str) -> bool {
        self.rewriting.contains(url)
    }

    /// Cache hit-rate counters, when the binary cache is enabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Sweep the binary cache down to its byte budget.
    pub async fn evict_cache(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.evict().await {
                warn!("Asset cache eviction failed: {e}");
            }
        }
    }

    /// Download `url` into its category directory and return the
    /// archive-local path (`/images/…`). Returns the URL unchanged when the
    /// reference is non-downloadable, blacklisted, blocked or failing.
    ///
    /// Boxed because CSS and JS rewriting recurse back into this method.
    pub fn download_asset<'a>(
        &'a self,
        url: &'a str,
        category: AssetCategory,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let trimmed = url.trim();
            if trimmed.is_empty()
                || trimmed.starts_with("data:")
                || trimmed.starts_with("blob:")
                || trimmed.starts_with('#')
                || trimmed.starts_with("javascript:")
                || trimmed.starts_with("mailto:")
                || trimmed.starts_with("tel:")
            {
                return url.to_string();
            }

            let normalized = strip_fragment(trimmed).to_string();

            if self.blacklist.matches(&normalized) {
                return url.to_string();
            }
            if self.is_blocked_host(&normalized) {
                debug!("Blocked tracking host, keeping reference: {normalized}");
                return url.to_string();
            }

            let cell = self
                .resolved
                .entry(normalized.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            cell.get_or_init(|| async {
                match self.fetch_and_store(&normalized, category).await {
                    Ok(local) => local,
                    Err(e) => {
                        warn!("Asset download failed for {normalized}: {e:#}");
                        normalized.clone()
                    }
                }
            })
            .await
            .clone()
        })
    }

    /// Download `url` keeping its original basename (bundler chunks, module
    /// federation files). Same dedup and failure semantics as
    /// [`download_asset`](Self::download_asset).
    pub fn download_verbatim<'a>(
        &'a self,
        url: &'a str,
        category: AssetCategory,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let normalized = strip_fragment(url.trim()).to_string();
            if normalized.is_empty() || self.blacklist.matches(&normalized) {
                return url.to_string();
            }

            let cell = self
                .resolved
                .entry(normalized.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            cell.get_or_init(|| async {
                let name = url_basename(&normalized);
                let rel = format!("{}/{}", category.dir(), name);
                match self.fetch_bytes(&normalized).await {
                    Ok((bytes, _)) => match self.write_at_relative_path(&rel, &bytes).await {
                        Ok(local) => local,
                        Err(e) => {
                            warn!("Failed to store chunk {normalized}: {e:#}");
                            normalized.clone()
                        }
                    },
                    Err(e) => {
                        warn!("Chunk download failed for {normalized}: {e:#}");
                        normalized.clone()
                    }
                }
            })
            .await
            .clone()
        })
    }

    /// Rewrite `url(...)` references in a block of CSS that lives at
    /// `base_url` (a stylesheet URL or the page URL for inline styles).
    pub async fn rewrite_inline_css(&self, css_text: &str, base_url: &str) -> String {
        css::rewrite_css(self, css_text, base_url).await
    }

    /// Write bytes at an explicit path relative to the archive root,
    /// sanitizing every component against traversal. Returns the
    /// archive-local path.
    pub async fn write_at_relative_path(&self, rel: &str, bytes: &[u8]) -> Result<String> {
        let mut safe = PathBuf::new();
        for component in rel.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                continue;
            }
            safe.push(sanitize_filename::sanitize(component));
        }
        if safe.as_os_str().is_empty() {
            anyhow::bail!("empty relative path");
        }

        let target = self.output_dir.join(&safe);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;

        Ok(format!("/{}", safe.to_string_lossy().replace('\\', "/")))
    }

    /// Raw body fetch for callers that manage their own placement (module
    /// federation mirroring).
    pub(crate) async fn fetch_raw(&self, url: &str) -> Result<Vec<u8>> {
        let (bytes, _) = self.fetch_bytes(url).await?;
        Ok(bytes)
    }

    /// Text body fetch with lossy UTF-8 decoding.
    pub(crate) async fn fetch_text(&self, url: &str) -> Result<String> {
        let bytes = self.fetch_raw(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_blocked_host(&self, url: &str) -> bool {
        let host = match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
            Some(h) => h.to_ascii_lowercase(),
            None => return false,
        };

        if ALLOWED_CDN_HOSTS.contains(&host.as_str()) {
            return false;
        }
        if self
            .base_url
            .host_str()
            .is_some_and(|base| base.eq_ignore_ascii_case(&host))
        {
            return false;
        }

        HOSTILE_DOMAINS
            .iter()
            .any(|blocked| host == *blocked || host.ends_with(&format!(".{blocked}")))
    }

    async fn fetch_and_store(&self, url: &str, category: AssetCategory) -> Result<String> {
        // Binary categories consult the cross-crawl cache before the network.
        if category.is_binary() {
            if let Some(cache) = &self.cache {
                if let Some(bytes) = cache.get(url).await {
                    let filename = archive_filename(url, category, None);
                    let rel = format!("{}/{}", category.dir(), filename);
                    return self.write_at_relative_path(&rel, &bytes).await;
                }
            }
        }

        let (bytes, content_type) = self.fetch_bytes(url).await?;

        if category.is_binary() {
            if let Some(cache) = &self.cache {
                cache.put(url, &bytes).await;
            }
        }

        let filename = archive_filename(url, category, content_type.as_deref());
        let rel = format!("{}/{}", category.dir(), filename);

        match category {
            AssetCategory::Css => {
                self.rewriting.insert(url.to_string());
                let text = String::from_utf8_lossy(&bytes);
                let rewritten = css::rewrite_css(self, &text, url).await;
                self.rewriting.remove(url);
                self.write_at_relative_path(&rel, rewritten.as_bytes()).await
            }
            AssetCategory::Js => {
                self.rewriting.insert(url.to_string());
                let text = String::from_utf8_lossy(&bytes);
                let rewritten = js::rewrite_js(self, &text, url).await;
                self.rewriting.remove(url);
                self.write_at_relative_path(&rel, rewritten.as_bytes()).await
            }
            _ => self.write_at_relative_path(&rel, &bytes).await,
        }
    }

    /// Streamed GET with browser-like headers and a hard size cap.
    async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", CHROME_USER_AGENT)
            .header("Accept", "*/*")
            .send()
            .await
            .context("request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {status}");
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let expected = response.content_length().unwrap_or(0) as usize;
        if expected > ASSET_MAX_BYTES {
            anyhow::bail!("asset too large: {expected} bytes");
        }

        let mut buffer = Vec::with_capacity(expected.min(ASSET_MAX_BYTES));
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("failed to read body chunk")?;
            if buffer.len() + chunk.len() > ASSET_MAX_BYTES {
                anyhow::bail!("asset exceeded size limit during download");
            }
            buffer.extend_from_slice(&chunk);
        }

        Ok((buffer, content_type))
    }
}

/// Pick the stored filename for an asset URL.
///
/// Extension priority: URL extension when it belongs to the category's
/// allowed set, then Content-Type, then the category fallback. The basename
/// is slugified with a 10-hex SHA-1 of the full URL appended for collision
/// resistance. Bundler chunk basenames are kept verbatim because their
/// runtime loader resolves them by exact name.
pub(super) fn archive_filename(
    url: &str,
    category: AssetCategory,
    content_type: Option<&str>,
) -> String {
    let basename = url_basename(url);
    if CHUNK_NAME_RE.is_match(&basename) {
        return basename;
    }

    let ext = url_extension(url)
        .filter(|e| category.allowed_extensions().contains(&e.as_str()))
        .or_else(|| {
            content_type
                .and_then(|ct| category.extension_from_content_type(ct))
                .map(str::to_string)
        })
        .unwrap_or_else(|| category.fallback_extension().to_string());

    let stem = match basename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => basename.clone(),
    };

    let digest = hex::encode(Sha1::digest(url.as_bytes()));
    format!("{}-{}.{}", slugify(&stem), &digest[..10], ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_prefers_url_extension() {
        let name = archive_filename(
            "https://example.com/css/site.CSS?v=3",
            AssetCategory::Css,
            Some("text/plain"),
        );
        assert!(name.starts_with("site-"));
        assert!(name.ends_with(".css"));
    }

    #[test]
    fn filename_falls_back_to_content_type() {
        let name = archive_filename(
            "https://example.com/img/photo",
            AssetCategory::Image,
            Some("image/webp"),
        );
        assert!(name.ends_with(".webp"));
    }

    #[test]
    fn filename_uses_category_fallback_last() {
        let name = archive_filename("https://example.com/f/face", AssetCategory::Font, None);
        assert!(name.ends_with(".woff2"));
    }

    #[test]
    fn filename_is_deterministic_per_url() {
        let a = archive_filename("https://example.com/a.png", AssetCategory::Image, None);
        let b = archive_filename("https://example.com/a.png", AssetCategory::Image, None);
        let c = archive_filename("https://example.com/b.png", AssetCategory::Image, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn chunk_basenames_kept_verbatim() {
        let name = archive_filename(
            "https://example.com/js/main.achunk.9fab02.js",
            AssetCategory::Js,
            None,
        );
        assert_eq!(name, "main.achunk.9fab02.js");

        let name = archive_filename(
            "https://example.com/js/vendor.chunk.00ff.mjs",
            AssetCategory::Js,
            None,
        );
        assert_eq!(name, "vendor.chunk.00ff.mjs");
    }

    #[test]
    fn slug_collision_suffix_differs_by_query() {
        let a = archive_filename("https://example.com/a.png?v=1", AssetCategory::Image, None);
        let b = archive_filename("https://example.com/a.png?v=2", AssetCategory::Image, None);
        assert_ne!(a, b, "different URLs must never collide on disk");
    }
}
