//! Content-addressed on-disk asset cache.
//!
//! Keys are SHA-256 of the asset URL, sharded by the first two hex chars so
//! no directory grows unbounded. Reads touch the file's mtime, which makes
//! eviction a plain oldest-mtime sweep. The cache directory is scoped per
//! host so one site's eviction pressure cannot flush another site's assets.
//!
//! Only binary asset categories (image/font/media) go through this cache:
//! CSS and JS are rewritten against each page's URL context and are not safe
//! to share verbatim across crawls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use anyhow::{Context, Result};
use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::utils::constants::DEFAULT_CACHE_MAX_MIB;

/// Hit/miss counters for one cache instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Host-scoped content-addressed cache with LRU-by-mtime eviction.
#[derive(Debug)]
pub struct AssetCache {
    root: PathBuf,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AssetCache {
    /// Open (creating if needed) the cache for one host under `base_dir`.
    pub fn open(base_dir: &Path, host: &str) -> Result<Self> {
        let root = base_dir.join(sanitize_filename::sanitize(host));
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache dir {}", root.display()))?;
        Ok(Self {
            root,
            max_bytes: DEFAULT_CACHE_MAX_MIB * 1024 * 1024,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Override the eviction budget (bytes). Used by tests and small hosts.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(&key[0..2]).join(key)
    }

    /// Fetch cached bytes for `url`, touching the entry's mtime on hit.
    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(&Self::key(url));
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Ok(file) = std::fs::OpenOptions::new().write(true).open(&path) {
                    let _ = file.set_modified(SystemTime::now());
                }
                debug!("Asset cache hit: {url}");
                Some(bytes)
            }
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store bytes for `url`. Best-effort: an I/O failure is logged, never
    /// propagated, because the caller already holds the bytes it needs.
    pub async fn put(&self, url: &str, bytes: &[u8]) {
        let key = Self::key(url);
        let path = self.entry_path(&key);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Asset cache shard create failed for {url}: {e}");
                return;
            }
        }
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            warn!("Asset cache write failed for {url}: {e}");
        }
    }

    /// Sweep the cache, deleting oldest-mtime entries until the tree fits
    /// the byte budget again.
    pub async fn evict(&self) -> Result<u64> {
        let root = self.root.clone();
        let max_bytes = self.max_bytes;
        tokio::task::spawn_blocking(move || evict_blocking(&root, max_bytes))
            .await
            .context("cache eviction task panicked")?
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

fn evict_blocking(root: &Path, max_bytes: u64) -> Result<u64> {
    let mut entries: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
    let mut total: u64 = 0;

    for entry in jwalk::WalkDir::new(root).skip_hidden(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        total += meta.len();
        entries.push((mtime, meta.len(), entry.path()));
    }

    if total <= max_bytes {
        return Ok(0);
    }

    entries.sort_by_key(|(mtime, _, _)| *mtime);

    let mut freed: u64 = 0;
    for (_, size, path) in entries {
        if total - freed <= max_bytes {
            break;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => freed += size,
            Err(e) => warn!("Cache eviction failed for {}: {e}", path.display()),
        }
    }

    debug!("Asset cache evicted {freed} bytes from {}", root.display());
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn get_after_put_hits() {
        let dir = TempDir::new().expect("tempdir");
        let cache = AssetCache::open(dir.path(), "example.com").expect("open");

        assert!(cache.get("https://example.com/a.png").await.is_none());
        cache.put("https://example.com/a.png", b"png-bytes").await;
        let hit = cache.get("https://example.com/a.png").await.expect("hit");
        assert_eq!(hit, b"png-bytes");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn entries_are_sharded_by_key_prefix() {
        let dir = TempDir::new().expect("tempdir");
        let cache = AssetCache::open(dir.path(), "example.com").expect("open");
        cache.put("https://example.com/b.woff2", b"font").await;

        let shards: Vec<_> = std::fs::read_dir(dir.path().join("example.com"))
            .expect("read")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].file_name().len(), 2);
    }

    #[tokio::test]
    async fn evict_removes_oldest_first() {
        let dir = TempDir::new().expect("tempdir");
        let cache = AssetCache::open(dir.path(), "example.com")
            .expect("open")
            .with_max_bytes(10);

        cache.put("https://example.com/old.png", &[0u8; 8]).await;
        // Age the first entry so mtime ordering is deterministic.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        cache.put("https://example.com/new.png", &[0u8; 8]).await;

        let freed = cache.evict().await.expect("evict");
        assert!(freed >= 8);
        assert!(cache.get("https://example.com/new.png").await.is_some());
        assert!(cache.get("https://example.com/old.png").await.is_none());
    }
}
