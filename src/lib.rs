//! sitevault: archive a public website into a self-contained, locally
//! servable copy.
//!
//! The crawl engine resolves a frontier from sitemaps, renders pages across
//! a pool of headless browsers (with a static fast path), deduplicates
//! assets through a content-addressed cache and rewrites every reference so
//! the archive serves offline from one root. The job layer runs crawls as
//! queue-backed state machines: enqueued, resumable, cancellable, scheduled
//! and finalized into an archive tree plus a prebuilt ZIP.

pub mod asset_cache;
pub mod assets;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod page;
pub mod queue;
pub mod rewriter;
pub mod scheduler;
pub mod sitemap;
pub mod state;
pub mod storage;
pub mod utils;

pub use asset_cache::{AssetCache, CacheStats};
pub use assets::{AssetCategory, AssetDownloader, Blacklist};
pub use config::{CrawlOptions, CrawlOptionsBuilder, CrawlTuning};
pub use db::{Crawl, CrawlLog, CrawlStatus, Database, Site};
pub use engine::progress::{CrawlLogLevel, CrawlProgress, LogSink, NoOpSink, ProgressSink};
pub use engine::{CrawlEngine, CrawlSummary};
pub use error::ArchiveError;
pub use jobs::{cancel_crawl, enqueue_crawl, JobProcessor};
pub use queue::{CrawlEvent, EventPublisher, JobEnvelope, JobQueue};
pub use rewriter::HtmlRewriter;
pub use scheduler::Scheduler;
pub use state::CrawlState;
pub use storage::{
    FinalizeProgress, LocalStorage, ObjectStorage, StorageAdapter, StorageConfig, UploadProgress,
};
