//! Environment-driven tuning knobs.
//!
//! Every knob the crawl engine sizes itself with comes from the process
//! environment, read once at startup. The defaults are what production runs
//! with; the overrides exist for constrained hosts and load testing.

use std::path::PathBuf;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Ignoring unparseable {name}={raw:?}");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Tunables consumed by the crawl engine and job processor.
#[derive(Debug, Clone)]
pub struct CrawlTuning {
    /// `ASSET_CACHE_ENABLED`: content-addressed cache for binary assets.
    pub asset_cache_enabled: bool,
    /// `LOCAL_TEMP_PATH`: staging root for in-progress crawl output.
    pub local_temp_path: PathBuf,
    /// `MAX_CRAWL_CONCURRENCY`: hard ceiling on worker concurrency.
    pub max_concurrency: usize,
    /// `CRAWL_MEMORY_BUFFER_GB`: memory held back from sizing math.
    pub memory_buffer_gb: f64,
    /// `CRAWL_MEMORY_MB_PER_PAGE`: estimated footprint of one page worker.
    pub memory_mb_per_page: f64,
    /// `CRAWL_MEMORY_MB_PER_BROWSER`: estimated footprint of one browser.
    pub memory_mb_per_browser: f64,
    /// `CRAWL_OVERRIDE_CONCURRENCY`: escape hatch pinning worker count.
    pub override_concurrency: Option<usize>,
    /// `CRAWL_OVERRIDE_BROWSERS`: escape hatch pinning browser count.
    pub override_browsers: Option<usize>,
    /// `CRAWL_DISABLE_RESOURCE_CHECKS`: skip the memory-based bounds.
    pub disable_resource_checks: bool,
    /// `CRAWL_PAGES_PER_BROWSER`: workers sharing one browser.
    pub pages_per_browser: usize,
    /// `CRAWL_STATE_FLUSH_BATCH_SIZE`: page results per state flush.
    pub state_flush_batch_size: usize,
    /// `CRAWL_PAGE_MAX_RETRIES`: retry attempts for transient page errors.
    pub page_max_retries: u32,
    /// `CRAWL_PAGE_RETRY_DELAY_MS`: base backoff delay, doubled per attempt.
    pub page_retry_delay_ms: u64,
}

impl Default for CrawlTuning {
    fn default() -> Self {
        Self {
            asset_cache_enabled: true,
            local_temp_path: std::env::temp_dir().join("sitevault"),
            max_concurrency: 30,
            memory_buffer_gb: 1.0,
            memory_mb_per_page: 350.0,
            memory_mb_per_browser: 600.0,
            override_concurrency: None,
            override_browsers: None,
            disable_resource_checks: false,
            pages_per_browser: 4,
            state_flush_batch_size: 25,
            page_max_retries: 2,
            page_retry_delay_ms: 2000,
        }
    }
}

impl CrawlTuning {
    /// Read the tuning knobs from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            asset_cache_enabled: env_flag("ASSET_CACHE_ENABLED", defaults.asset_cache_enabled),
            local_temp_path: std::env::var("LOCAL_TEMP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_temp_path),
            max_concurrency: env_parse("MAX_CRAWL_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency),
            memory_buffer_gb: env_parse("CRAWL_MEMORY_BUFFER_GB")
                .unwrap_or(defaults.memory_buffer_gb),
            memory_mb_per_page: env_parse("CRAWL_MEMORY_MB_PER_PAGE")
                .unwrap_or(defaults.memory_mb_per_page),
            memory_mb_per_browser: env_parse("CRAWL_MEMORY_MB_PER_BROWSER")
                .unwrap_or(defaults.memory_mb_per_browser),
            override_concurrency: env_parse("CRAWL_OVERRIDE_CONCURRENCY"),
            override_browsers: env_parse("CRAWL_OVERRIDE_BROWSERS"),
            disable_resource_checks: env_flag("CRAWL_DISABLE_RESOURCE_CHECKS", false),
            pages_per_browser: env_parse("CRAWL_PAGES_PER_BROWSER")
                .filter(|&v: &usize| v > 0)
                .unwrap_or(defaults.pages_per_browser),
            state_flush_batch_size: env_parse("CRAWL_STATE_FLUSH_BATCH_SIZE")
                .filter(|&v: &usize| v > 0)
                .unwrap_or(defaults.state_flush_batch_size),
            page_max_retries: env_parse("CRAWL_PAGE_MAX_RETRIES")
                .unwrap_or(defaults.page_max_retries),
            page_retry_delay_ms: env_parse("CRAWL_PAGE_RETRY_DELAY_MS")
                .unwrap_or(defaults.page_retry_delay_ms),
        }
    }
}
