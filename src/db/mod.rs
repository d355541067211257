//! SQLite persistence for sites, crawls, logs and settings.
//!
//! WAL mode with a generous busy timeout so the job workers, the scheduler
//! and the external API can share one database file. Every access goes
//! through [`Database`]; nothing else in the crate touches SQL.

pub mod models;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::storage::FinalizeProgress;
pub use models::{Crawl, CrawlLog, CrawlStatus, Site};

/// Settings key holding the blacklist applied to every crawl.
pub const GLOBAL_BLACKLIST_KEY: &str = "globalDownloadBlacklist";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sites (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    concurrency INTEGER NOT NULL DEFAULT 5,
    max_pages INTEGER,
    exclude_patterns TEXT NOT NULL DEFAULT '[]',
    download_blacklist TEXT NOT NULL DEFAULT '[]',
    remove_webflow_badge INTEGER NOT NULL DEFAULT 0,
    max_archives_to_keep INTEGER NOT NULL DEFAULT 3,
    redirects_csv TEXT,
    schedule_enabled INTEGER NOT NULL DEFAULT 0,
    schedule_cron TEXT,
    next_scheduled_at TEXT,
    storage_type TEXT NOT NULL DEFAULT 'local',
    storage_path TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawls (
    id TEXT PRIMARY KEY,
    site_id TEXT NOT NULL REFERENCES sites(id),
    status TEXT NOT NULL DEFAULT 'pending',
    started_at TEXT,
    completed_at TEXT,
    total_pages INTEGER NOT NULL DEFAULT 0,
    succeeded_pages INTEGER NOT NULL DEFAULT 0,
    failed_pages INTEGER NOT NULL DEFAULT 0,
    upload_total_bytes INTEGER NOT NULL DEFAULT 0,
    upload_uploaded_bytes INTEGER NOT NULL DEFAULT 0,
    upload_files_total INTEGER NOT NULL DEFAULT 0,
    upload_files_uploaded INTEGER NOT NULL DEFAULT 0,
    upload_current_file TEXT,
    output_path TEXT,
    output_size_bytes INTEGER,
    error_message TEXT,
    created_at TEXT NOT NULL
);

-- The one-active-crawl-per-site guard and the retention query both hit this.
CREATE INDEX IF NOT EXISTS idx_crawls_site_status ON crawls(site_id, status);

CREATE TABLE IF NOT EXISTS crawl_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    crawl_id TEXT NOT NULL REFERENCES crawls(id),
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    url TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_crawl_logs_crawl ON crawl_logs(crawl_id);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Connection pool plus typed queries.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("failed to open SQLite database")?;

        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to initialize database schema")?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .journal_mode(SqliteJournalMode::Memory);
        // One connection, never recycled: every pooled connection would
        // otherwise get its own empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory database")?;
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    // ---- sites -----------------------------------------------------------

    pub async fn upsert_site(&self, site: &Site) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sites (
                id, name, base_url, concurrency, max_pages, exclude_patterns,
                download_blacklist, remove_webflow_badge, max_archives_to_keep,
                redirects_csv, schedule_enabled, schedule_cron, next_scheduled_at,
                storage_type, storage_path, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                base_url = excluded.base_url,
                concurrency = excluded.concurrency,
                max_pages = excluded.max_pages,
                exclude_patterns = excluded.exclude_patterns,
                download_blacklist = excluded.download_blacklist,
                remove_webflow_badge = excluded.remove_webflow_badge,
                max_archives_to_keep = excluded.max_archives_to_keep,
                redirects_csv = excluded.redirects_csv,
                schedule_enabled = excluded.schedule_enabled,
                schedule_cron = excluded.schedule_cron,
                next_scheduled_at = excluded.next_scheduled_at,
                storage_type = excluded.storage_type,
                storage_path = excluded.storage_path
            "#,
        )
        .bind(&site.id)
        .bind(&site.name)
        .bind(&site.base_url)
        .bind(site.concurrency)
        .bind(site.max_pages)
        .bind(serde_json::to_string(&site.exclude_patterns)?)
        .bind(serde_json::to_string(&site.download_blacklist)?)
        .bind(site.remove_webflow_badge)
        .bind(site.max_archives_to_keep)
        .bind(&site.redirects_csv)
        .bind(site.schedule_enabled)
        .bind(&site.schedule_cron)
        .bind(site.next_scheduled_at)
        .bind(&site.storage_type)
        .bind(&site.storage_path)
        .bind(site.created_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert site")?;
        Ok(())
    }

    pub async fn get_site(&self, id: &str) -> Result<Option<Site>> {
        let row = sqlx::query("SELECT * FROM sites WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load site")?;
        row.map(site_from_row).transpose()
    }

    /// Sites whose schedule is enabled and due at `now`.
    pub async fn list_due_sites(&self, now: DateTime<Utc>) -> Result<Vec<Site>> {
        let rows = sqlx::query(
            "SELECT * FROM sites WHERE schedule_enabled = 1 \
             AND next_scheduled_at IS NOT NULL AND next_scheduled_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("failed to list due sites")?;
        rows.into_iter().map(site_from_row).collect()
    }

    pub async fn set_next_scheduled_at(
        &self,
        site_id: &str,
        next: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE sites SET next_scheduled_at = ? WHERE id = ?")
            .bind(next)
            .bind(site_id)
            .execute(&self.pool)
            .await
            .context("failed to update next_scheduled_at")?;
        Ok(())
    }

    // ---- crawls ----------------------------------------------------------

    pub async fn has_active_crawl(&self, site_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM crawls WHERE site_id = ? \
             AND status IN ('pending', 'running', 'uploading')",
        )
        .bind(site_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count active crawls")?;
        Ok(count > 0)
    }

    /// Create a `pending` crawl for the site, enforcing the one-active-crawl
    /// invariant inside the same transaction as the insert.
    pub async fn create_pending_crawl(&self, site_id: &str) -> Result<Crawl> {
        let mut tx = self.pool.begin().await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM crawls WHERE site_id = ? \
             AND status IN ('pending', 'running', 'uploading')",
        )
        .bind(site_id)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            anyhow::bail!("site {site_id} already has an active crawl");
        }

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        sqlx::query("INSERT INTO crawls (id, site_id, status, created_at) VALUES (?, ?, 'pending', ?)")
            .bind(&id)
            .bind(site_id)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Created pending crawl {id} for site {site_id}");

        self.get_crawl(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("crawl {id} vanished after insert"))
    }

    pub async fn get_crawl(&self, id: &str) -> Result<Option<Crawl>> {
        let row = sqlx::query("SELECT * FROM crawls WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load crawl")?;
        row.map(crawl_from_row).transpose()
    }

    pub async fn get_crawl_status(&self, id: &str) -> Result<Option<CrawlStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM crawls WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load crawl status")?;
        Ok(status.as_deref().and_then(CrawlStatus::parse))
    }

    pub async fn mark_running(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE crawls SET status = 'running', started_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_uploading(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE crawls SET status = 'uploading' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(
        &self,
        id: &str,
        output_path: &str,
        output_size_bytes: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET status = 'completed', completed_at = ?, \
             output_path = ?, output_size_bytes = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(output_path)
        .bind(output_size_bytes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET status = 'failed', completed_at = ?, error_message = ? \
             WHERE id = ? AND status NOT IN ('completed', 'cancelled')",
        )
        .bind(Utc::now())
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal cancellation, as issued by the external cancel endpoint.
    /// Only an active crawl can transition; terminal states stay put.
    pub async fn mark_cancelled(&self, id: &str, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE crawls SET status = 'cancelled', completed_at = ?, error_message = ? \
             WHERE id = ? AND status IN ('pending', 'running', 'uploading')",
        )
        .bind(Utc::now())
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_page_counts(
        &self,
        id: &str,
        total: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET total_pages = ?, succeeded_pages = ?, failed_pages = ? WHERE id = ?",
        )
        .bind(total)
        .bind(succeeded)
        .bind(failed)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_upload_progress(&self, id: &str, progress: &FinalizeProgress) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET upload_total_bytes = ?, upload_uploaded_bytes = ?, \
             upload_files_total = ?, upload_files_uploaded = ?, upload_current_file = ? \
             WHERE id = ?",
        )
        .bind(progress.total_bytes as i64)
        .bind(progress.uploaded_bytes as i64)
        .bind(progress.files_total as i64)
        .bind(progress.files_uploaded as i64)
        .bind(&progress.current_file)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Completed crawls for a site, newest first; the retention input.
    pub async fn completed_crawls_for_site(&self, site_id: &str) -> Result<Vec<Crawl>> {
        let rows = sqlx::query(
            "SELECT * FROM crawls WHERE site_id = ? AND status = 'completed' \
             ORDER BY completed_at DESC",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list completed crawls")?;
        rows.into_iter().map(crawl_from_row).collect()
    }

    // ---- crawl logs ------------------------------------------------------

    pub async fn insert_log(
        &self,
        crawl_id: &str,
        level: &str,
        message: &str,
        url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO crawl_logs (crawl_id, level, message, url, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(crawl_id)
        .bind(level)
        .bind(message)
        .bind(url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn logs_for_crawl(&self, crawl_id: &str, limit: i64) -> Result<Vec<CrawlLog>> {
        let rows = sqlx::query(
            "SELECT * FROM crawl_logs WHERE crawl_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(crawl_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(CrawlLog {
                    id: row.try_get("id")?,
                    crawl_id: row.try_get("crawl_id")?,
                    level: row.try_get("level")?,
                    message: row.try_get("message")?,
                    url: row.try_get("url")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    // ---- settings --------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load setting")?;
        raw.map(|raw| serde_json::from_str(&raw).context("corrupt setting value"))
            .transpose()
    }

    pub async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The blacklist rules applied to every crawl on top of per-site rules.
    pub async fn global_download_blacklist(&self) -> Result<Vec<String>> {
        match self.get_setting(GLOBAL_BLACKLIST_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }
}

fn site_from_row(row: SqliteRow) -> Result<Site> {
    let exclude_patterns: String = row.try_get("exclude_patterns")?;
    let download_blacklist: String = row.try_get("download_blacklist")?;
    Ok(Site {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        concurrency: row.try_get("concurrency")?,
        max_pages: row.try_get("max_pages")?,
        exclude_patterns: serde_json::from_str(&exclude_patterns).unwrap_or_default(),
        download_blacklist: serde_json::from_str(&download_blacklist).unwrap_or_default(),
        remove_webflow_badge: row.try_get("remove_webflow_badge")?,
        max_archives_to_keep: row.try_get("max_archives_to_keep")?,
        redirects_csv: row.try_get("redirects_csv")?,
        schedule_enabled: row.try_get("schedule_enabled")?,
        schedule_cron: row.try_get("schedule_cron")?,
        next_scheduled_at: row.try_get("next_scheduled_at")?,
        storage_type: row.try_get("storage_type")?,
        storage_path: row.try_get("storage_path")?,
        created_at: row.try_get("created_at")?,
    })
}

fn crawl_from_row(row: SqliteRow) -> Result<Crawl> {
    let status: String = row.try_get("status")?;
    Ok(Crawl {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        status: CrawlStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown crawl status {status:?}"))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        total_pages: row.try_get("total_pages")?,
        succeeded_pages: row.try_get("succeeded_pages")?,
        failed_pages: row.try_get("failed_pages")?,
        upload_total_bytes: row.try_get("upload_total_bytes")?,
        upload_uploaded_bytes: row.try_get("upload_uploaded_bytes")?,
        upload_files_total: row.try_get("upload_files_total")?,
        upload_files_uploaded: row.try_get("upload_files_uploaded")?,
        upload_current_file: row.try_get("upload_current_file")?,
        output_path: row.try_get("output_path")?,
        output_size_bytes: row.try_get("output_size_bytes")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_site(id: &str) -> Site {
        Site {
            id: id.to_string(),
            name: "Example".to_string(),
            base_url: "https://example.com".to_string(),
            concurrency: 5,
            max_pages: None,
            exclude_patterns: vec!["/draft/".to_string()],
            download_blacklist: vec!["domain:tracker.io".to_string()],
            remove_webflow_badge: true,
            max_archives_to_keep: 2,
            redirects_csv: None,
            schedule_enabled: false,
            schedule_cron: None,
            next_scheduled_at: None,
            storage_type: "local".to_string(),
            storage_path: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn site_roundtrip() {
        let db = Database::open_in_memory().await.expect("open");
        db.upsert_site(&test_site("s1")).await.expect("upsert");

        let loaded = db.get_site("s1").await.expect("get").expect("present");
        assert_eq!(loaded.base_url, "https://example.com");
        assert_eq!(loaded.exclude_patterns, vec!["/draft/"]);
        assert!(loaded.remove_webflow_badge);
    }

    #[tokio::test]
    async fn one_active_crawl_per_site() {
        let db = Database::open_in_memory().await.expect("open");
        db.upsert_site(&test_site("s1")).await.expect("upsert");

        let first = db.create_pending_crawl("s1").await.expect("first");
        assert_eq!(first.status, CrawlStatus::Pending);
        assert!(db.create_pending_crawl("s1").await.is_err());

        // A terminal crawl frees the slot.
        db.mark_failed(&first.id, "boom").await.expect("fail");
        db.create_pending_crawl("s1").await.expect("second");
    }

    #[tokio::test]
    async fn cancel_only_touches_active_crawls() {
        let db = Database::open_in_memory().await.expect("open");
        db.upsert_site(&test_site("s1")).await.expect("upsert");
        let crawl = db.create_pending_crawl("s1").await.expect("create");

        assert!(db.mark_cancelled(&crawl.id, "Cancelled by user").await.expect("cancel"));
        let loaded = db.get_crawl(&crawl.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, CrawlStatus::Cancelled);
        assert!(loaded.completed_at.is_some());

        // A second cancel is a no-op, and failed never overwrites cancelled.
        assert!(!db.mark_cancelled(&crawl.id, "again").await.expect("cancel"));
        db.mark_failed(&crawl.id, "late failure").await.expect("fail");
        let loaded = db.get_crawl(&crawl.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, CrawlStatus::Cancelled);
    }

    #[tokio::test]
    async fn settings_hold_global_blacklist() {
        let db = Database::open_in_memory().await.expect("open");
        assert!(db.global_download_blacklist().await.expect("empty").is_empty());

        db.set_setting(
            GLOBAL_BLACKLIST_KEY,
            &serde_json::json!(["https://ads.example.com/*"]),
        )
        .await
        .expect("set");
        assert_eq!(
            db.global_download_blacklist().await.expect("list"),
            vec!["https://ads.example.com/*"]
        );
    }

    #[tokio::test]
    async fn completed_crawls_order_newest_first() {
        let db = Database::open_in_memory().await.expect("open");
        db.upsert_site(&test_site("s1")).await.expect("upsert");

        let a = db.create_pending_crawl("s1").await.expect("a");
        db.mark_completed(&a.id, "archives/a", 10).await.expect("complete");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = db.create_pending_crawl("s1").await.expect("b");
        db.mark_completed(&b.id, "archives/b", 20).await.expect("complete");

        let list = db.completed_crawls_for_site("s1").await.expect("list");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, b.id);
    }
}
