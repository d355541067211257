//! The per-site crawl engine.
//!
//! Owns the worker pool for one crawl: frontier resolution, concurrency
//! sizing, browser slots, retry, durable resume state, progress reporting
//! and cooperative cancellation. Everything downstream (asset pipeline, page
//! processing, rewriting) hangs off the workers this module spawns.

pub mod browser;
pub mod progress;
pub mod redirects;
pub mod retry;
pub mod sizing;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashSet;
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use url::Url;

use crate::asset_cache::AssetCache;
use crate::assets::{AssetDownloader, Blacklist};
use crate::config::{CrawlOptions, CrawlTuning};
use crate::error::{is_cancelled, ArchiveError};
use crate::page::PageProcessor;
use crate::sitemap;
use crate::state::{self, CrawlState};
use crate::utils::constants::CHROME_USER_AGENT;

use self::browser::BrowserSlot;
use self::progress::{CrawlLogLevel, CrawlProgress, LogSink, NoOpSink, ProgressSink};
use self::sizing::{plan_pool, HostResources};

/// Result summary of one finished crawl.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub static_pages: usize,
    pub cache_hit_rate: f64,
}

/// Engine for one crawl. Construct, attach sinks, run once.
pub struct CrawlEngine {
    options: CrawlOptions,
    tuning: CrawlTuning,
    progress: Arc<dyn ProgressSink>,
    logs: Arc<dyn LogSink>,
}

impl CrawlEngine {
    pub fn new(options: CrawlOptions, tuning: CrawlTuning) -> Self {
        Self {
            options,
            tuning,
            progress: Arc::new(NoOpSink),
            logs: Arc::new(NoOpSink),
        }
    }

    #[must_use]
    pub fn with_sinks(
        mut self,
        progress: Arc<dyn ProgressSink>,
        logs: Arc<dyn LogSink>,
    ) -> Self {
        self.progress = progress;
        self.logs = logs;
        self
    }

    /// Run the crawl to completion or cancellation.
    ///
    /// `should_abort` flips to `true` when the crawl is cancelled; workers
    /// observe it on every loop iteration. On abort the final state is
    /// flushed, every browser is closed and [`ArchiveError::Cancelled`]
    /// is returned.
    pub async fn run(&self, should_abort: watch::Receiver<bool>) -> Result<CrawlSummary> {
        let started = Instant::now();
        let options = &self.options;

        let client = reqwest::Client::builder()
            .user_agent(CHROME_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("failed to build HTTP client")?;

        // Frontier: sitemap URLs, exclude-filtered, capped.
        let mut all_urls = sitemap::resolve(&client, options.base_url()).await?;
        all_urls.retain(|url| {
            !options
                .exclude_patterns_compiled()
                .iter()
                .any(|re| re.is_match(url))
        });
        if all_urls.is_empty() {
            // No sitemap anywhere; the crawl starts from the root page.
            all_urls.push(options.base_url().to_string());
        }
        if let Some(max) = options.max_pages() {
            all_urls.truncate(max);
        }
        self.logs.log(
            CrawlLogLevel::Info,
            &format!("Frontier resolved: {} URLs", all_urls.len()),
            None,
        );

        // Durable resume state.
        let state_path = state::state_file_path(options.output_dir());
        let previous = state::load(&state_path).await?;
        let frontier = state::filter_for_resume(
            &all_urls,
            previous.as_ref(),
            options.resume(),
            options.retry_failed(),
        );
        let crawl_state = match previous {
            Some(existing) if options.resume() || options.retry_failed() => existing,
            _ => CrawlState::new(options.base_url(), options.output_dir()),
        };

        tokio::fs::create_dir_all(options.output_dir())
            .await
            .context("failed to create output dir")?;

        if frontier.is_empty() {
            // Nothing to do: no browser ever launches, but the run still
            // finalizes its output config and reports honest totals.
            info!("Frontier empty after resume filtering; finalizing immediately");
            let summary = CrawlSummary {
                total: all_urls.len(),
                succeeded: crawl_state.succeeded.len(),
                failed: crawl_state.failed.len(),
                duration_ms: started.elapsed().as_millis() as u64,
                static_pages: 0,
                cache_hit_rate: 0.0,
            };
            self.progress.progress(CrawlProgress {
                total: summary.total,
                succeeded: summary.succeeded,
                failed: summary.failed,
                current_url: None,
            });
            self.write_output_config().await?;
            return Ok(summary);
        }

        // Asset pipeline shared by every worker.
        let host = Url::parse(options.base_url())
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown-host".to_string());
        let cache = if self.tuning.asset_cache_enabled {
            let cache_dir = self.tuning.local_temp_path.join("asset-cache");
            match AssetCache::open(&cache_dir, &host) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    warn!("Asset cache unavailable, continuing without: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        let blacklist = Blacklist::from_rules(options.download_blacklist());
        let assets = Arc::new(AssetDownloader::new(
            client.clone(),
            options.output_dir().clone(),
            options.base_url(),
            blacklist,
            cache,
        )?);

        let processor = Arc::new(PageProcessor::new(
            client,
            Arc::clone(&assets),
            options.output_dir().clone(),
            options.base_url().to_string(),
            options.remove_webflow_badge(),
            options.try_static_first(),
        ));

        let plan = plan_pool(options.concurrency(), &self.tuning, &HostResources::detect());

        let slots: Vec<Arc<BrowserSlot>> = (0..plan.num_browsers)
            .map(|index| Arc::new(BrowserSlot::new(index, options.headless())))
            .collect();

        let shared = Arc::new(SharedCrawl {
            queue: Mutex::new(frontier.iter().cloned().collect()),
            visited: DashSet::new(),
            in_flight: AtomicUsize::new(0),
            initial_total: frontier.len(),
            enqueued_total: AtomicUsize::new(frontier.len()),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            static_pages: AtomicUsize::new(0),
            pending: SyncMutex::new(PendingBatches::default()),
            state: Mutex::new(crawl_state),
            state_path,
            flush_batch_size: self.tuning.state_flush_batch_size,
            discover_links: !options.sitemap_only() && options.discover_links(),
            max_pages: options.max_pages(),
            base_url: options.base_url().to_string(),
        });

        // Spawn the pool: workers are distributed round-robin over slots.
        let mut handles = Vec::with_capacity(plan.effective_concurrency);
        for worker_index in 0..plan.effective_concurrency {
            let slot = Arc::clone(&slots[worker_index % plan.num_browsers]);
            let ctx = WorkerCtx {
                shared: Arc::clone(&shared),
                processor: Arc::clone(&processor),
                slot,
                progress: Arc::clone(&self.progress),
                logs: Arc::clone(&self.logs),
                should_abort: should_abort.clone(),
                max_retries: self.tuning.page_max_retries,
                base_delay_ms: self.tuning.page_retry_delay_ms,
            };
            handles.push(tokio::spawn(worker_loop(worker_index, ctx)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task panicked: {e}");
            }
        }

        // Final flush runs on every exit path, abort included.
        shared.flush(true).await;

        for slot in &slots {
            slot.shutdown().await;
        }
        assets.evict_cache().await;

        if *should_abort.borrow() {
            self.logs.log(CrawlLogLevel::Warn, "Crawl aborted", None);
            return Err(ArchiveError::Cancelled.into());
        }

        self.write_output_config().await?;

        let cache_hit_rate = assets.cache_stats().map(|s| s.hit_rate).unwrap_or(0.0);
        let summary = CrawlSummary {
            total: shared.progress_total(),
            succeeded: shared.succeeded.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            duration_ms: started.elapsed().as_millis() as u64,
            static_pages: shared.static_pages.load(Ordering::Relaxed),
            cache_hit_rate,
        };
        self.logs.log(
            CrawlLogLevel::Info,
            &format!(
                "Crawl finished: {}/{} pages in {}ms ({} static, cache hit rate {:.0}%)",
                summary.succeeded,
                summary.total,
                summary.duration_ms,
                summary.static_pages,
                summary.cache_hit_rate * 100.0
            ),
            None,
        );
        Ok(summary)
    }

    /// Write the hosting config (`vercel.json`) the archive is served with.
    async fn write_output_config(&self) -> Result<()> {
        let mut config = serde_json::json!({
            "cleanUrls": true,
            "trailingSlash": false,
        });

        if let Some(csv_path) = self.options.redirects_csv() {
            match redirects::parse_redirects_csv(csv_path) {
                Ok(rules) if !rules.is_empty() => {
                    config["redirects"] = serde_json::to_value(&rules)?;
                }
                Ok(_) => {}
                Err(e) => warn!("Redirects CSV unusable, omitting: {e:#}"),
            }
        }

        let path = self.options.output_dir().join("vercel.json");
        tokio::fs::write(&path, serde_json::to_string_pretty(&config)?)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[derive(Default)]
struct PendingBatches {
    succeeded: Vec<String>,
    failed: Vec<String>,
}

/// State shared by every worker of one crawl.
struct SharedCrawl {
    queue: Mutex<VecDeque<String>>,
    visited: DashSet<String>,
    /// Pages currently being processed; an idle worker only exits once the
    /// queue is empty AND nothing in flight can still discover links.
    in_flight: AtomicUsize,
    initial_total: usize,
    /// Every URL ever enqueued; the progress denominator's high-water mark.
    enqueued_total: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    static_pages: AtomicUsize,
    /// Never held across an await; a sync lock keeps record() cheap.
    pending: SyncMutex<PendingBatches>,
    state: Mutex<CrawlState>,
    state_path: std::path::PathBuf,
    flush_batch_size: usize,
    discover_links: bool,
    max_pages: Option<usize>,
    base_url: String,
}

impl SharedCrawl {
    fn progress_total(&self) -> usize {
        self.initial_total
            .max(self.enqueued_total.load(Ordering::Relaxed))
    }

    fn snapshot(&self, current_url: Option<String>) -> CrawlProgress {
        CrawlProgress {
            total: self.progress_total(),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            current_url,
        }
    }

    async fn record(&self, url: String, success: bool) {
        let should_flush = {
            let mut pending = self.pending.lock();
            if success {
                pending.succeeded.push(url);
            } else {
                pending.failed.push(url);
            }
            pending.succeeded.len() + pending.failed.len() >= self.flush_batch_size
        };
        if should_flush {
            self.flush(false).await;
        }
    }

    /// Persist pending batches. `force` flushes even a partial batch (used
    /// on completion and abort).
    async fn flush(&self, force: bool) {
        let (succeeded, failed) = {
            let mut pending = self.pending.lock();
            if pending.succeeded.is_empty() && pending.failed.is_empty() {
                return;
            }
            if !force && pending.succeeded.len() + pending.failed.len() < self.flush_batch_size {
                return;
            }
            (
                std::mem::take(&mut pending.succeeded),
                std::mem::take(&mut pending.failed),
            )
        };

        let mut state = self.state.lock().await;
        if let Err(e) =
            state::update_progress(&self.state_path, &mut state, &succeeded, &failed).await
        {
            warn!("State flush failed: {e:#}");
        }
    }

    /// Append newly discovered same-origin links under the base URL.
    async fn enqueue_discovered(&self, links: &[String]) -> usize {
        if !self.discover_links || links.is_empty() {
            return 0;
        }
        let cap = self.max_pages.unwrap_or(usize::MAX);
        let mut added = 0;
        let mut queue = self.queue.lock().await;
        for link in links {
            if self.enqueued_total.load(Ordering::Relaxed) >= cap {
                break;
            }
            if !link.starts_with(self.base_url.trim_end_matches('/')) {
                continue;
            }
            let normalized = crate::utils::strip_fragment(link).to_string();
            if self.visited.contains(&normalized) || queue.contains(&normalized) {
                continue;
            }
            queue.push_back(normalized);
            self.enqueued_total.fetch_add(1, Ordering::Relaxed);
            added += 1;
        }
        added
    }
}

struct WorkerCtx {
    shared: Arc<SharedCrawl>,
    processor: Arc<PageProcessor>,
    slot: Arc<BrowserSlot>,
    progress: Arc<dyn ProgressSink>,
    logs: Arc<dyn LogSink>,
    should_abort: watch::Receiver<bool>,
    max_retries: u32,
    base_delay_ms: u64,
}

async fn worker_loop(worker_index: usize, ctx: WorkerCtx) {
    debug!("Worker {worker_index} starting");
    loop {
        if *ctx.should_abort.borrow() {
            debug!("Worker {worker_index} observed abort");
            break;
        }

        let url = { ctx.shared.queue.lock().await.pop_front() };
        let Some(url) = url else {
            if ctx.shared.discover_links
                && ctx.shared.in_flight.load(Ordering::Acquire) > 0
            {
                // A busy peer may still grow the frontier.
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                continue;
            }
            break;
        };

        // visited is set-once at dequeue; a URL never runs twice.
        if !ctx.shared.visited.insert(url.clone()) {
            continue;
        }

        ctx.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        ctx.progress.progress(ctx.shared.snapshot(Some(url.clone())));

        // Generation observed at the start of the failing attempt, so
        // recovery can tell a dead browser from one a peer already replaced.
        let observed_generation = Arc::new(AtomicU64::new(ctx.slot.generation()));

        let result = {
            let processor = Arc::clone(&ctx.processor);
            let slot = Arc::clone(&ctx.slot);
            let abort = ctx.should_abort.clone();
            let url = url.clone();
            let observed = Arc::clone(&observed_generation);
            let logs = Arc::clone(&ctx.logs);
            let recovery_slot = Arc::clone(&ctx.slot);

            retry::with_retry(
                move || {
                    let processor = Arc::clone(&processor);
                    let slot = Arc::clone(&slot);
                    let abort = abort.clone();
                    let url = url.clone();
                    let observed = Arc::clone(&observed);
                    async move {
                        observed.store(slot.generation(), Ordering::Release);
                        processor.process(&url, &slot, &abort).await
                    }
                },
                ctx.max_retries,
                ctx.base_delay_ms,
                move |_attempt, err| {
                    let slot = Arc::clone(&recovery_slot);
                    let observed = Arc::clone(&observed_generation);
                    let logs = Arc::clone(&logs);
                    async move {
                        logs.log(CrawlLogLevel::Warn, &format!("Retrying: {err:#}"), None);
                        if retry::is_browser_closed_error(&err) {
                            if let Err(recover_err) =
                                slot.recover(observed.load(Ordering::Acquire)).await
                            {
                                warn!("Browser recovery failed: {recover_err:#}");
                            }
                        }
                    }
                },
            )
            .await
        };

        ctx.shared.in_flight.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(outcome) => {
                ctx.shared.succeeded.fetch_add(1, Ordering::Relaxed);
                if outcome.was_static {
                    ctx.shared.static_pages.fetch_add(1, Ordering::Relaxed);
                }
                let added = ctx.shared.enqueue_discovered(&outcome.page_links).await;
                if added > 0 {
                    debug!("Worker {worker_index} discovered {added} new URLs");
                }
                ctx.shared.record(url, true).await;
            }
            Err(err) if is_cancelled(&err) => {
                debug!("Worker {worker_index} cancelled mid-page");
                break;
            }
            Err(err) => {
                ctx.shared.failed.fetch_add(1, Ordering::Relaxed);
                ctx.logs.log(
                    CrawlLogLevel::Error,
                    &format!("Page failed: {err:#}"),
                    Some(&url),
                );
                ctx.shared.record(url, false).await;
            }
        }

        ctx.progress.progress(ctx.shared.snapshot(None));
    }
    debug!("Worker {worker_index} exiting");
}
