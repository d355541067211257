//! Crawl job lifecycle.
//!
//! The job processor consumes queue envelopes and owns the
//! `pending → running → uploading → completed | failed | cancelled` state
//! machine for each crawl it dequeues. Engine callbacks fan into the
//! database and the crawl's pub/sub channel; cancellation is observed by
//! polling the crawl row's status and surfaced to the engine as a watch
//! channel.

mod zip;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::config::{CrawlOptions, CrawlTuning};
use crate::db::{Crawl, CrawlStatus, Database, Site};
use crate::engine::progress::{CrawlLogLevel, CrawlProgress, LogSink, ProgressSink};
use crate::engine::{CrawlEngine, CrawlSummary};
use crate::error::is_cancelled;
use crate::queue::{CrawlEvent, EventPublisher, JobEnvelope, JobQueue};
use crate::storage::{FinalizeProgress, StorageAdapter, StorageConfig, UploadProgress};

pub use self::zip::build_zip;

/// How often a running job re-reads its crawl row to observe cancellation.
const CANCEL_POLL_INTERVAL_MS: u64 = 2000;

/// Create the pending crawl row and enqueue its job envelope. If the
/// enqueue fails the row is rolled forward to `failed` so no orphan pending
/// crawl survives.
pub async fn enqueue_crawl(db: &Database, queue: &JobQueue, site_id: &str) -> Result<Crawl> {
    let crawl = db.create_pending_crawl(site_id).await?;
    let envelope = JobEnvelope {
        site_id: site_id.to_string(),
        crawl_id: crawl.id.clone(),
    };
    if let Err(e) = queue.enqueue(&envelope).await {
        error!("Enqueue failed for crawl {}: {e:#}", crawl.id);
        db.mark_failed(&crawl.id, &format!("Failed to enqueue crawl job: {e:#}"))
            .await
            .ok();
        return Err(e);
    }
    Ok(crawl)
}

/// Cancel a crawl: remove the job from the queue while it is still pending,
/// then write the terminal row. Running workers observe the status flip on
/// their next poll tick.
pub async fn cancel_crawl(
    db: &Database,
    queue: &JobQueue,
    events: &EventPublisher,
    crawl_id: &str,
) -> Result<bool> {
    let Some(crawl) = db.get_crawl(crawl_id).await? else {
        return Ok(false);
    };

    if crawl.status == CrawlStatus::Pending {
        let envelope = JobEnvelope {
            site_id: crawl.site_id.clone(),
            crawl_id: crawl.id.clone(),
        };
        match queue.remove(&envelope).await {
            Ok(true) => debug!("Removed pending job {crawl_id} from queue"),
            Ok(false) => debug!("Job {crawl_id} already picked up"),
            Err(e) => warn!("Queue removal failed for {crawl_id}: {e:#}"),
        }
    }

    let cancelled = db.mark_cancelled(crawl_id, "Cancelled by user").await?;
    if cancelled {
        events
            .publish(
                crawl_id,
                &CrawlEvent::Status {
                    status: CrawlStatus::Cancelled.as_str().to_string(),
                },
            )
            .await
            .ok();
    }
    Ok(cancelled)
}

/// Messages flowing from the (synchronous) engine sinks to the async pump
/// that mirrors them into the database and pub/sub.
enum SinkMessage {
    Progress(CrawlProgress),
    Log(CrawlLogLevel, String, Option<String>),
    Upload(FinalizeProgress),
}

/// Sink handed to the engine; forwards into the pump channel.
struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ProgressSink for ChannelSink {
    fn progress(&self, progress: CrawlProgress) {
        let _ = self.tx.send(SinkMessage::Progress(progress));
    }
}

impl LogSink for ChannelSink {
    fn log(&self, level: CrawlLogLevel, message: &str, url: Option<&str>) {
        let _ = self.tx.send(SinkMessage::Log(
            level,
            message.to_string(),
            url.map(str::to_string),
        ));
    }
}

/// Queue consumer owning crawl execution end to end.
///
/// Each site chooses its storage backend (`storage_type`/`storage_path`);
/// the processor resolves the adapter per job from [`StorageConfig`].
pub struct JobProcessor {
    db: Database,
    queue: JobQueue,
    events: EventPublisher,
    storage: StorageConfig,
    tuning: CrawlTuning,
}

impl JobProcessor {
    pub fn new(
        db: Database,
        queue: JobQueue,
        events: EventPublisher,
        storage: StorageConfig,
        tuning: CrawlTuning,
    ) -> Self {
        Self {
            db,
            queue,
            events,
            storage,
            tuning,
        }
    }

    /// Worker loop: pull envelopes until shutdown flips.
    pub async fn run_worker(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!("Job worker {worker_id} started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let envelope = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.queue.dequeue() => match result {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => {
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("Worker {worker_id} dequeue error: {e:#}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                },
            };

            info!("Worker {worker_id} picked up crawl {}", envelope.crawl_id);
            if let Err(e) = self.process_job(&envelope).await {
                error!("Job {} failed: {e:#}", envelope.crawl_id);
            }
        }
        info!("Job worker {worker_id} stopped");
    }

    /// Run one crawl job through its full lifecycle.
    pub async fn process_job(&self, envelope: &JobEnvelope) -> Result<()> {
        let crawl_id = envelope.crawl_id.clone();

        let Some(crawl) = self.db.get_crawl(&crawl_id).await? else {
            warn!("Crawl {crawl_id} not found, dropping job");
            return Ok(());
        };
        if crawl.status != CrawlStatus::Pending {
            // Cancelled while queued, or a duplicate delivery.
            info!("Crawl {crawl_id} is {}, skipping", crawl.status.as_str());
            return Ok(());
        }

        let Some(site) = self.db.get_site(&envelope.site_id).await? else {
            self.db
                .mark_failed(&crawl_id, "Site not found")
                .await
                .ok();
            return Ok(());
        };

        let storage = match self
            .storage
            .adapter_for(&site.storage_type, site.storage_path.as_deref())
        {
            Ok(storage) => storage,
            Err(e) => {
                self.db
                    .mark_failed(&crawl_id, &format!("Storage unavailable: {e:#}"))
                    .await
                    .ok();
                self.publish_status(&crawl_id, CrawlStatus::Failed).await;
                return Ok(());
            }
        };

        self.db.mark_running(&crawl_id).await?;
        self.publish_status(&crawl_id, CrawlStatus::Running).await;

        let result = self.run_crawl(&site, &crawl_id, &storage).await;

        match result {
            Ok(summary) => {
                info!(
                    "Crawl {crawl_id} completed: {}/{} pages ({} failed)",
                    summary.succeeded, summary.total, summary.failed
                );
                if let Err(e) = self.apply_retention(&site, &storage).await {
                    warn!("Retention sweep failed for site {}: {e:#}", site.id);
                }
            }
            Err(e) if is_cancelled(&e) => {
                // The cancel endpoint already wrote the terminal row; this is
                // belt and braces for a crawl aborted some other way.
                self.db.mark_cancelled(&crawl_id, "Cancelled by user").await.ok();
                self.publish_status(&crawl_id, CrawlStatus::Cancelled).await;
                info!("Crawl {crawl_id} cancelled");
            }
            Err(e) => {
                self.db
                    .mark_failed(&crawl_id, &format!("{e:#}"))
                    .await
                    .ok();
                self.publish_status(&crawl_id, CrawlStatus::Failed).await;
                error!("Crawl {crawl_id} failed: {e:#}");
            }
        }
        Ok(())
    }

    /// Crawl, finalize and upload. Any error bubbles to `process_job`, which
    /// writes the terminal state.
    async fn run_crawl(
        &self,
        site: &Site,
        crawl_id: &str,
        storage: &Arc<dyn StorageAdapter>,
    ) -> Result<CrawlSummary> {
        let temp_dir = storage.create_temp_dir(crawl_id).await?;

        let mut blacklist = site.download_blacklist.clone();
        blacklist.extend(self.db.global_download_blacklist().await?);

        let options = CrawlOptions::builder()
            .base_url(&site.base_url)
            .output_dir(&temp_dir)
            .concurrency(site.concurrency.clamp(1, 30) as usize)
            .max_pages(site.max_pages.map(|n| n.max(0) as usize))
            .exclude_patterns(site.exclude_patterns.clone())
            .download_blacklist(blacklist)
            .remove_webflow_badge(site.remove_webflow_badge)
            .redirects_csv(site.redirects_csv.clone().map(Into::into))
            .try_static_first(true)
            .sitemap_only(true)
            // A requeued job lands in the same staging dir; pages that
            // already succeeded are skipped via the state file.
            .resume(true)
            .build()?;

        // Cancellation: poll the crawl row, feed the engine's watch channel.
        let (abort_tx, abort_rx) = watch::channel(false);
        let poll_db = self.db.clone();
        let poll_id = crawl_id.to_string();
        let poll_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(CANCEL_POLL_INTERVAL_MS));
            loop {
                interval.tick().await;
                match poll_db.get_crawl_status(&poll_id).await {
                    Ok(Some(CrawlStatus::Cancelled)) | Ok(None) => {
                        let _ = abort_tx.send(true);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Cancel poll error for {poll_id}: {e:#}"),
                }
                if abort_tx.is_closed() {
                    break;
                }
            }
        });

        // Sink pump: engine callbacks → DB rows + pub/sub events.
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let pump_task = tokio::spawn(sink_pump(
            self.db.clone(),
            self.events.clone(),
            crawl_id.to_string(),
            sink_rx,
        ));

        let sink = Arc::new(ChannelSink { tx: sink_tx.clone() });
        let engine = CrawlEngine::new(options, self.tuning.clone())
            .with_sinks(sink.clone(), sink);

        let crawl_result = engine.run(abort_rx).await;
        poll_task.abort();
        // The engine holds the only other sink handles; dropping it lets the
        // pump drain and exit once sink_tx goes.
        drop(engine);

        let summary = match crawl_result {
            Ok(summary) => summary,
            Err(e) => {
                drop(sink_tx);
                let _ = pump_task.await;
                return Err(e);
            }
        };

        self.db
            .update_page_counts(
                crawl_id,
                summary.total as i64,
                summary.succeeded as i64,
                summary.failed as i64,
            )
            .await?;

        // Finalize: promote the temp tree, then ship the prebuilt ZIP.
        self.db.mark_uploading(crawl_id).await?;
        self.publish_status(crawl_id, CrawlStatus::Uploading).await;

        let zip_path = self
            .tuning
            .local_temp_path
            .join(format!("{crawl_id}.zip"));
        zip::build_zip(&temp_dir, &zip_path).await?;

        let finalize_tx = sink_tx.clone();
        let final_prefix = storage
            .move_to_final(
                &temp_dir,
                crawl_id,
                Some(Arc::new(move |p: FinalizeProgress| {
                    let _ = finalize_tx.send(SinkMessage::Upload(p));
                })),
            )
            .await
            .context("archive finalization failed")?;

        let zip_key = format!("{final_prefix}.zip");
        let zip_tx = sink_tx.clone();
        storage
            .write_file_from(
                &zip_key,
                &zip_path,
                Some(Arc::new(move |p: UploadProgress| {
                    let _ = zip_tx.send(SinkMessage::Upload(FinalizeProgress {
                        total_bytes: p.total_bytes,
                        uploaded_bytes: p.uploaded_bytes,
                        files_total: 1,
                        files_uploaded: u64::from(p.uploaded_bytes >= p.total_bytes),
                        current_file: Some("archive.zip".to_string()),
                    }));
                })),
            )
            .await
            .context("zip upload failed")?;
        tokio::fs::remove_file(&zip_path).await.ok();

        let output_size = storage.get_size(&final_prefix).await.unwrap_or(0);
        self.db
            .mark_completed(crawl_id, &final_prefix, output_size as i64)
            .await?;
        self.publish_status(crawl_id, CrawlStatus::Completed).await;

        drop(sink_tx);
        let _ = pump_task.await;

        Ok(summary)
    }

    /// Delete archives beyond the site's keep-count: the directory tree and
    /// its sibling ZIP, both explicitly.
    async fn apply_retention(
        &self,
        site: &Site,
        storage: &Arc<dyn StorageAdapter>,
    ) -> Result<()> {
        let keep = site.max_archives_to_keep.max(0) as usize;
        let completed = self.db.completed_crawls_for_site(&site.id).await?;

        for output_path in retention_victims(&completed, keep) {
            info!("Retention: deleting archive {} of site {}", output_path, site.id);
            if let Err(e) = storage.delete_dir(&output_path).await {
                warn!("Failed to delete {output_path}: {e:#}");
            }
            let zip_key = format!("{output_path}.zip");
            if let Err(e) = storage.delete_dir(&zip_key).await {
                warn!("Failed to delete {zip_key}: {e:#}");
            }
        }
        Ok(())
    }

    async fn publish_status(&self, crawl_id: &str, status: CrawlStatus) {
        let event = CrawlEvent::Status {
            status: status.as_str().to_string(),
        };
        if let Err(e) = self.events.publish(crawl_id, &event).await {
            debug!("Status publish failed for {crawl_id}: {e:#}");
        }
    }
}

/// Archive paths past the keep-count, given completed crawls newest first.
fn retention_victims(completed: &[Crawl], keep: usize) -> Vec<String> {
    completed
        .iter()
        .skip(keep)
        .filter_map(|crawl| crawl.output_path.clone())
        .collect()
}

/// Mirrors sink messages into the database and pub/sub until the channel
/// closes.
async fn sink_pump(
    db: Database,
    events: EventPublisher,
    crawl_id: String,
    mut rx: mpsc::UnboundedReceiver<SinkMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            SinkMessage::Progress(progress) => {
                if let Err(e) = db
                    .update_page_counts(
                        &crawl_id,
                        progress.total as i64,
                        progress.succeeded as i64,
                        progress.failed as i64,
                    )
                    .await
                {
                    debug!("Progress write failed: {e:#}");
                }
                events
                    .publish(&crawl_id, &CrawlEvent::Progress { progress })
                    .await
                    .ok();
            }
            SinkMessage::Log(level, message, url) => {
                if let Err(e) = db
                    .insert_log(&crawl_id, level.as_str(), &message, url.as_deref())
                    .await
                {
                    debug!("Log write failed: {e:#}");
                }
                events
                    .publish(&crawl_id, &CrawlEvent::Log { level, message, url })
                    .await
                    .ok();
            }
            SinkMessage::Upload(progress) => {
                if let Err(e) = db.update_upload_progress(&crawl_id, &progress).await {
                    debug!("Upload progress write failed: {e:#}");
                }
                events
                    .publish(
                        &crawl_id,
                        &CrawlEvent::Upload {
                            uploaded_bytes: progress.uploaded_bytes,
                            total_bytes: progress.total_bytes,
                            files_uploaded: progress.files_uploaded,
                            files_total: progress.files_total,
                            current_file: progress.current_file,
                        },
                    )
                    .await
                    .ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn completed(id: &str, output_path: Option<&str>) -> Crawl {
        Crawl {
            id: id.to_string(),
            site_id: "s1".to_string(),
            status: CrawlStatus::Completed,
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            total_pages: 1,
            succeeded_pages: 1,
            failed_pages: 0,
            upload_total_bytes: 0,
            upload_uploaded_bytes: 0,
            upload_files_total: 0,
            upload_files_uploaded: 0,
            upload_current_file: None,
            output_path: output_path.map(str::to_string),
            output_size_bytes: Some(1),
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn retention_keeps_newest_archives() {
        let crawls = vec![
            completed("newest", Some("archives/newest")),
            completed("middle", Some("archives/middle")),
            completed("oldest", Some("archives/oldest")),
        ];
        assert_eq!(
            retention_victims(&crawls, 2),
            vec!["archives/oldest".to_string()]
        );
        assert!(retention_victims(&crawls, 3).is_empty());
        assert_eq!(retention_victims(&crawls, 0).len(), 3);
    }

    #[test]
    fn retention_skips_rows_without_output() {
        let crawls = vec![
            completed("a", Some("archives/a")),
            completed("b", None),
            completed("c", Some("archives/c")),
        ];
        assert_eq!(
            retention_victims(&crawls, 1),
            vec!["archives/c".to_string()]
        );
    }
}
