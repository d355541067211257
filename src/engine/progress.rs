//! Narrow interfaces for streaming progress and logs out of the engine.
//!
//! The job processor supplies implementations that multiplex into the
//! database and the pub/sub channel; tests supply in-memory collectors. The
//! engine never knows who is listening.

use serde::{Deserialize, Serialize};

/// A progress snapshot emitted on every work-loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlProgress {
    /// Denominator: `max(initial frontier size, queue high-water mark)` so
    /// link discovery can grow it.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
}

/// Log severity mirrored into the crawl's persistent trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl CrawlLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Receives progress snapshots.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, progress: CrawlProgress);
}

/// Receives log lines, optionally tied to a URL.
pub trait LogSink: Send + Sync {
    fn log(&self, level: CrawlLogLevel, message: &str, url: Option<&str>);
}

/// Sink that drops everything; the default for library callers that only
/// want the summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl ProgressSink for NoOpSink {
    #[inline(always)]
    fn progress(&self, _progress: CrawlProgress) {}
}

impl LogSink for NoOpSink {
    #[inline(always)]
    fn log(&self, _level: CrawlLogLevel, _message: &str, _url: Option<&str>) {}
}
