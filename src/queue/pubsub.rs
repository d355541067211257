//! Crawl event publishing.
//!
//! Events go out on `crawl:<crawlId>` as JSON. Delivery is fire-and-forget
//! and unordered; subscribers are expected to be idempotent.

use anyhow::Result;
use log::debug;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};

use crate::engine::progress::{CrawlLogLevel, CrawlProgress};

/// One message on a crawl's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CrawlEvent {
    Progress {
        #[serde(flatten)]
        progress: CrawlProgress,
    },
    Log {
        level: CrawlLogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Status {
        status: String,
    },
    Upload {
        #[serde(rename = "uploadedBytes")]
        uploaded_bytes: u64,
        #[serde(rename = "totalBytes")]
        total_bytes: u64,
        #[serde(rename = "filesUploaded")]
        files_uploaded: u64,
        #[serde(rename = "filesTotal")]
        files_total: u64,
        #[serde(rename = "currentFile", skip_serializing_if = "Option::is_none")]
        current_file: Option<String>,
    },
}

/// Publishes crawl events over redis pub/sub.
#[derive(Clone)]
pub struct EventPublisher {
    conn: MultiplexedConnection,
}

impl EventPublisher {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub fn channel(crawl_id: &str) -> String {
        format!("crawl:{crawl_id}")
    }

    /// Publish one event. Failures are logged by callers at most; a dead
    /// subscriber channel must never fail a crawl.
    pub async fn publish(&self, crawl_id: &str, event: &CrawlEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(Self::channel(crawl_id))
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        debug!("Published to crawl:{crawl_id} ({receivers} subscribers)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tags() {
        let event = CrawlEvent::Progress {
            progress: CrawlProgress {
                total: 10,
                succeeded: 3,
                failed: 1,
                current_url: Some("https://example.com/a".into()),
            },
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains(r#""type":"progress""#));
        assert!(json.contains(r#""total":10"#));

        let event = CrawlEvent::Log {
            level: CrawlLogLevel::Warn,
            message: "retrying".into(),
            url: None,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains(r#""type":"log""#));
        assert!(!json.contains("url"));
    }

    #[test]
    fn channel_names_follow_convention() {
        assert_eq!(EventPublisher::channel("abc"), "crawl:abc");
    }
}
