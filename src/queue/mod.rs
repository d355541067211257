//! Redis-backed job queue and progress pub/sub.
//!
//! The queue is a plain list with deterministic JSON envelopes: job id =
//! crawl id, which makes dedup and directed removal (`LREM` against the
//! serialized envelope) possible. Subscribers listen on `crawl:<id>` for
//! JSON-encoded progress, log and status events.

mod pubsub;

use anyhow::{Context, Result};
use log::{debug, info};
use redis::{aio::MultiplexedConnection, AsyncCommands};
use serde::{Deserialize, Serialize};

pub use pubsub::{CrawlEvent, EventPublisher};

/// Queue payload. Field order is fixed: serialization must be byte-stable
/// for `LREM` removal to find the enqueued entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "siteId")]
    pub site_id: String,
    #[serde(rename = "crawlId")]
    pub crawl_id: String,
}

/// Connect to redis and hand out the shared multiplexed connection.
pub async fn connect(redis_url: &str) -> Result<MultiplexedConnection> {
    info!("Connecting to Redis at {redis_url}");
    let client = redis::Client::open(redis_url).context("failed to create Redis client")?;
    client
        .get_multiplexed_async_connection()
        .await
        .context("failed to connect to Redis")
}

/// List-based crawl job queue.
#[derive(Clone)]
pub struct JobQueue {
    conn: MultiplexedConnection,
    namespace: String,
}

impl JobQueue {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            namespace: "sitevault".to_string(),
        }
    }

    fn pending_key(&self) -> String {
        format!("{}:crawl_jobs", self.namespace)
    }

    /// Push a job envelope; newest jobs go to the back of the list.
    pub async fn enqueue(&self, envelope: &JobEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope).context("failed to serialize envelope")?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(self.pending_key(), &payload)
            .await
            .context("failed to enqueue job")?;
        debug!("Enqueued crawl job {}", envelope.crawl_id);
        Ok(())
    }

    /// Non-blocking pop. `None` means the queue is empty; workers poll.
    /// (A blocking `BRPOP` would stall every other command sharing the
    /// multiplexed connection.)
    pub async fn dequeue(&self) -> Result<Option<JobEnvelope>> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = conn
            .rpop(self.pending_key(), None)
            .await
            .context("failed to pop job")?;
        match popped {
            Some(payload) => {
                let envelope =
                    serde_json::from_str(&payload).context("corrupt job envelope in queue")?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    /// Remove a still-pending job from the queue (cancel path). Returns
    /// whether an entry was removed.
    pub async fn remove(&self, envelope: &JobEnvelope) -> Result<bool> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .lrem(self.pending_key(), 0, &payload)
            .await
            .context("failed to remove job")?;
        Ok(removed > 0)
    }

    /// Queue depth, for operational visibility.
    pub async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(self.pending_key()).await?;
        Ok(len)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serialization_is_stable() {
        let envelope = JobEnvelope {
            site_id: "site-1".into(),
            crawl_id: "crawl-1".into(),
        };
        let a = serde_json::to_string(&envelope).expect("serialize");
        let b = serde_json::to_string(&envelope).expect("serialize");
        assert_eq!(a, b);
        assert_eq!(a, r#"{"siteId":"site-1","crawlId":"crawl-1"}"#);

        let parsed: JobEnvelope = serde_json::from_str(&a).expect("parse");
        assert_eq!(parsed, envelope);
    }
}
