//! Cron-driven crawl scheduling.
//!
//! A one-minute tick promotes every site with a due `next_scheduled_at`
//! into a pending crawl + queue job, then recomputes the next occurrence
//! from the site's cron expression. A redis `SET NX EX` lock keyed
//! `scheduler:crawl-check` serializes dispatch across replicas: whichever
//! replica wins the lock does that tick's work.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{debug, info, warn};
use redis::aio::MultiplexedConnection;
use tokio::sync::watch;
use uuid::Uuid;

use crate::db::{Database, Site};
use crate::jobs::enqueue_crawl;
use crate::queue::JobQueue;

const LOCK_KEY: &str = "scheduler:crawl-check";
const LOCK_TTL_SECS: u64 = 55;
const TICK_INTERVAL_SECS: u64 = 60;

/// Compute the next occurrence of a cron expression after `now`.
///
/// Accepts the common 5-field form; the seconds field the `cron` crate
/// expects is prepended when missing.
pub fn next_occurrence(expression: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    let schedule = Schedule::from_str(&normalized)
        .with_context(|| format!("invalid cron expression {expression:?}"))?;
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron expression {expression:?} has no future occurrence"))
}

/// Recompute `next_scheduled_at` for a site from its cron settings; clears
/// it when scheduling is disabled. Invalid cron strings are reported and
/// leave the field untouched.
pub fn refresh_next_scheduled_at(site: &mut Site, now: DateTime<Utc>) -> Result<()> {
    if !site.schedule_enabled {
        site.next_scheduled_at = None;
        return Ok(());
    }
    let Some(expression) = site.schedule_cron.as_deref() else {
        site.next_scheduled_at = None;
        return Ok(());
    };
    site.next_scheduled_at = Some(next_occurrence(expression, now)?);
    Ok(())
}

/// Upsert a site, recomputing its schedule first.
pub async fn upsert_site(db: &Database, mut site: Site) -> Result<Site> {
    if let Err(e) = refresh_next_scheduled_at(&mut site, Utc::now()) {
        warn!("Site {} schedule not refreshed: {e:#}", site.id);
    }
    db.upsert_site(&site).await?;
    Ok(site)
}

/// The cron loop. One instance per process; the distributed lock keeps the
/// fleet honest.
pub struct Scheduler {
    db: Database,
    queue: JobQueue,
    redis: MultiplexedConnection,
    instance_id: String,
}

impl Scheduler {
    pub fn new(db: Database, queue: JobQueue, redis: MultiplexedConnection) -> Self {
        Self {
            db,
            queue,
            redis,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Run ticks until shutdown flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started (instance {})", self.instance_id);
        let mut interval = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Scheduler tick failed: {e:#}");
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Scheduler stopped");
    }

    /// One dispatch pass, guarded by the distributed lock.
    pub async fn tick(&self) -> Result<()> {
        if !self.try_acquire_lock().await? {
            debug!("Another replica holds the scheduler lock");
            return Ok(());
        }

        let now = Utc::now();
        let due = self.db.list_due_sites(now).await?;
        if due.is_empty() {
            return Ok(());
        }
        info!("Scheduler: {} site(s) due", due.len());

        for site in due {
            if self.db.has_active_crawl(&site.id).await? {
                debug!("Site {} still has an active crawl, skipping dispatch", site.id);
                // The schedule still advances so the site is not re-checked
                // every tick until the running crawl finishes.
            } else {
                match enqueue_crawl(&self.db, &self.queue, &site.id).await {
                    Ok(crawl) => info!("Scheduled crawl {} for site {}", crawl.id, site.id),
                    Err(e) => {
                        warn!("Failed to schedule crawl for site {}: {e:#}", site.id);
                        continue;
                    }
                }
            }

            let Some(expression) = site.schedule_cron.as_deref() else {
                continue;
            };
            match next_occurrence(expression, now) {
                Ok(next) => {
                    self.db.set_next_scheduled_at(&site.id, Some(next)).await?;
                    debug!("Site {} next run at {next}", site.id);
                }
                Err(e) => {
                    // Leave next_scheduled_at untouched; an operator fixing
                    // the cron string re-arms the schedule.
                    warn!("Site {} has an invalid cron expression: {e:#}", site.id);
                }
            }
        }
        Ok(())
    }

    async fn try_acquire_lock(&self) -> Result<bool> {
        let mut conn = self.redis.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(LOCK_KEY)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(LOCK_TTL_SECS)
            .query_async(&mut conn)
            .await
            .context("scheduler lock acquisition failed")?;
        Ok(acquired.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_cron_is_normalized() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 15).unwrap();
        let next = next_occurrence("0 3 * * *", now).expect("next");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap());
    }

    #[test]
    fn six_field_cron_passes_through() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 15).unwrap();
        let next = next_occurrence("0 */10 * * * *", now).expect("next");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 40, 0).unwrap());
    }

    #[test]
    fn invalid_cron_is_an_error() {
        assert!(next_occurrence("not a cron", Utc::now()).is_err());
    }

    #[test]
    fn refresh_clears_when_disabled() {
        let mut site = Site {
            id: "s".into(),
            name: "s".into(),
            base_url: "https://example.com".into(),
            concurrency: 5,
            max_pages: None,
            exclude_patterns: vec![],
            download_blacklist: vec![],
            remove_webflow_badge: false,
            max_archives_to_keep: 3,
            redirects_csv: None,
            schedule_enabled: false,
            schedule_cron: Some("0 3 * * *".into()),
            next_scheduled_at: Some(Utc::now()),
            storage_type: "local".into(),
            storage_path: None,
            created_at: Utc::now(),
        };
        refresh_next_scheduled_at(&mut site, Utc::now()).expect("refresh");
        assert!(site.next_scheduled_at.is_none());

        site.schedule_enabled = true;
        refresh_next_scheduled_at(&mut site, Utc::now()).expect("refresh");
        assert!(site.next_scheduled_at.is_some());
    }
}
