//! Persistent records: sites, crawls, crawl logs and settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for one archivable origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Worker concurrency, 1–30.
    pub concurrency: i64,
    pub max_pages: Option<i64>,
    /// Regexes filtering sitemap URLs.
    pub exclude_patterns: Vec<String>,
    /// Per-site download blacklist rules.
    pub download_blacklist: Vec<String>,
    pub remove_webflow_badge: bool,
    /// How many completed archives to keep before retention deletes old ones.
    pub max_archives_to_keep: i64,
    pub redirects_csv: Option<String>,
    pub schedule_enabled: bool,
    pub schedule_cron: Option<String>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub storage_type: String,
    pub storage_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of one crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Pending,
    Running,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl CrawlStatus {
    pub const ACTIVE: [CrawlStatus; 3] = [Self::Pending, Self::Running, Self::Uploading];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One execution of one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crawl {
    pub id: String,
    pub site_id: String,
    pub status: CrawlStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_pages: i64,
    pub succeeded_pages: i64,
    pub failed_pages: i64,
    pub upload_total_bytes: i64,
    pub upload_uploaded_bytes: i64,
    pub upload_files_total: i64,
    pub upload_files_uploaded: i64,
    pub upload_current_file: Option<String>,
    pub output_path: Option<String>,
    pub output_size_bytes: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only crawl trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlLog {
    pub id: i64,
    pub crawl_id: String,
    pub level: String,
    pub message: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips() {
        for status in [
            CrawlStatus::Pending,
            CrawlStatus::Running,
            CrawlStatus::Uploading,
            CrawlStatus::Completed,
            CrawlStatus::Failed,
            CrawlStatus::Cancelled,
        ] {
            assert_eq!(CrawlStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CrawlStatus::parse("nonsense"), None);
    }

    #[test]
    fn terminal_set_is_exact() {
        assert!(CrawlStatus::Completed.is_terminal());
        assert!(CrawlStatus::Failed.is_terminal());
        assert!(CrawlStatus::Cancelled.is_terminal());
        assert!(!CrawlStatus::Pending.is_terminal());
        assert!(!CrawlStatus::Running.is_terminal());
        assert!(!CrawlStatus::Uploading.is_terminal());
    }
}
