//! Durable per-crawl resume state.
//!
//! The engine records which URLs succeeded and which failed so an interrupted
//! crawl can be resumed (or its failures retried) without re-fetching
//! everything. Writes are whole-file replacements of a single JSON document
//! inside the output tree.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::utils::constants::STATE_FILE_NAME;

/// On-disk crawl state. `succeeded` and `failed` are disjoint after every
/// flush: a retry that succeeds supersedes its earlier failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlState {
    pub base_url: String,
    pub output_dir: PathBuf,
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    /// Epoch milliseconds of the last save.
    pub last_updated: i64,
}

impl CrawlState {
    pub fn new(base_url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            output_dir: output_dir.into(),
            succeeded: BTreeSet::new(),
            failed: BTreeSet::new(),
            last_updated: Utc::now().timestamp_millis(),
        }
    }
}

/// Path of the state file inside an output directory.
pub fn state_file_path(output_dir: &Path) -> PathBuf {
    output_dir.join(STATE_FILE_NAME)
}

/// Load state from `path`. A missing file is not an error; corrupt JSON is.
pub async fn load(path: &Path) -> Result<Option<CrawlState>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let state: CrawlState = serde_json::from_str(&raw)
                .with_context(|| format!("corrupt crawl state at {}", path.display()))?;
            Ok(Some(state))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Save state to `path`, refreshing `last_updated`. The write replaces the
/// whole file so a partially-applied update can never be observed on reload.
pub async fn save(path: &Path, state: &mut CrawlState) -> Result<()> {
    state.last_updated = Utc::now().timestamp_millis();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let json = serde_json::to_string_pretty(state).context("failed to serialize crawl state")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Union the batches into the state sets and persist.
///
/// A URL present in both sets after the union is treated as succeeded; the
/// failure record is dropped.
pub async fn update_progress(
    path: &Path,
    state: &mut CrawlState,
    succeeded_batch: &[String],
    failed_batch: &[String],
) -> Result<()> {
    state.succeeded.extend(succeeded_batch.iter().cloned());
    state.failed.extend(failed_batch.iter().cloned());
    state.failed = &state.failed - &state.succeeded;
    save(path, state).await
}

/// Compute the frontier for this run.
///
/// - `retry_failed` restricts the frontier to previously-failed URLs;
/// - `resume` skips everything already succeeded;
/// - otherwise the full URL list is returned.
pub fn filter_for_resume(
    all_urls: &[String],
    state: Option<&CrawlState>,
    resume: bool,
    retry_failed: bool,
) -> Vec<String> {
    match state {
        Some(state) if retry_failed => state.failed.iter().cloned().collect(),
        Some(state) if resume => all_urls
            .iter()
            .filter(|url| !state.succeeded.contains(*url))
            .cloned()
            .collect(),
        _ => all_urls.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn roundtrips_state_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = state_file_path(dir.path());
        let mut state = CrawlState::new("https://example.com", dir.path());
        state.succeeded.insert("https://example.com/".into());

        save(&path, &mut state).await.expect("save");
        let loaded = load(&path).await.expect("load").expect("present");
        assert_eq!(loaded.base_url, "https://example.com");
        assert!(loaded.succeeded.contains("https://example.com/"));
        assert!(loaded.last_updated > 0);
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = TempDir::new().expect("tempdir");
        assert!(load(&state_file_path(dir.path())).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn retry_success_supersedes_failure() {
        let dir = TempDir::new().expect("tempdir");
        let path = state_file_path(dir.path());
        let mut state = CrawlState::new("https://example.com", dir.path());

        update_progress(&path, &mut state, &[], &urls(&["https://example.com/a"]))
            .await
            .expect("flush");
        assert!(state.failed.contains("https://example.com/a"));

        update_progress(&path, &mut state, &urls(&["https://example.com/a"]), &[])
            .await
            .expect("flush");
        assert!(state.succeeded.contains("https://example.com/a"));
        assert!(state.failed.is_empty(), "succeeded and failed must stay disjoint");
    }

    #[test]
    fn resume_filters_succeeded() {
        let mut state = CrawlState::new("https://example.com", "/tmp/out");
        state.succeeded.insert("https://example.com/a".into());
        state.failed.insert("https://example.com/b".into());

        let all = urls(&[
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/c",
        ]);

        let resumed = filter_for_resume(&all, Some(&state), true, false);
        assert_eq!(resumed, urls(&["https://example.com/b", "https://example.com/c"]));

        let retries = filter_for_resume(&all, Some(&state), false, true);
        assert_eq!(retries, urls(&["https://example.com/b"]));

        let full = filter_for_resume(&all, Some(&state), false, false);
        assert_eq!(full, all);

        let no_state = filter_for_resume(&all, None, true, true);
        assert_eq!(no_state, all);
    }
}
