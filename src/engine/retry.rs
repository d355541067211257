//! Retry policy for page processing.
//!
//! Transient failures (network flakes, rate limiting, dead browsers) are
//! retried with exponential backoff; everything else is raised immediately.
//! Cancellation always short-circuits.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use log::warn;

use crate::error::is_cancelled;

/// Signatures a dead CDP connection leaves in error messages. Retrying one
/// of these is what triggers browser-slot recovery.
const BROWSER_CLOSED_SIGNATURES: &[&str] = &[
    "browser has been closed",
    "browser closed",
    "target closed",
    "session closed",
    "connection closed",
    "websocket connection error",
    "oneshot canceled",
];

/// Whether the error message names a closed browser/CDP connection.
pub fn is_browser_closed_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    BROWSER_CLOSED_SIGNATURES.iter().any(|sig| msg.contains(sig))
}

/// Classify an error as transient (retryable).
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    if is_cancelled(err) {
        return false;
    }
    let msg = format!("{err:#}").to_lowercase();

    if msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("net::err")
        || msg.contains("econnrefused")
        || msg.contains("connection refused")
        || msg.contains("econnreset")
        || msg.contains("connection reset")
    {
        return true;
    }

    // HTTP 429 and the 5xx family
    if msg.contains("429") || msg.contains("too many requests") {
        return true;
    }
    if let Some(idx) = msg.find("http 5") {
        let rest = msg[idx + 6..].as_bytes();
        if rest.len() >= 2 && rest[0].is_ascii_digit() && rest[1].is_ascii_digit() {
            return true;
        }
    }

    is_browser_closed_error(err)
}

/// Run `operation` with up to `max_retries` retries for transient errors.
///
/// Backoff is `base_delay_ms * 2^attempt` with a little jitter. The
/// `on_retry` hook fires once per retry (after classification, before the
/// sleep) so callers can recover shared resources and surface warnings.
pub async fn with_retry<T, F, Fut, H, HFut>(
    mut operation: F,
    max_retries: u32,
    base_delay_ms: u64,
    mut on_retry: H,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    H: FnMut(u32, anyhow::Error) -> HFut,
    HFut: Future<Output = ()>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries || !is_transient_error(&err) {
                    return Err(err);
                }

                let delay = base_delay_ms.saturating_mul(1u64 << attempt);
                let jitter = rand::random_range(0..(delay / 4).max(1));
                warn!(
                    "Transient failure (attempt {}/{}), retrying in {}ms: {err:#}",
                    attempt + 1,
                    max_retries,
                    delay
                );
                on_retry(attempt, err).await;
                tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn classification_matches_taxonomy() {
        assert!(is_transient_error(&anyhow::anyhow!("Page navigation timeout after 30 seconds")));
        assert!(is_transient_error(&anyhow::anyhow!("net::ERR_CONNECTION_RESET")));
        assert!(is_transient_error(&anyhow::anyhow!("HTTP 503")));
        assert!(is_transient_error(&anyhow::anyhow!("HTTP 429 Too Many Requests")));
        assert!(is_transient_error(&anyhow::anyhow!("browser has been closed")));
        assert!(!is_transient_error(&anyhow::anyhow!("HTTP 404")));
        assert!(!is_transient_error(&anyhow::anyhow!("invalid page URL")));
        assert!(!is_transient_error(&anyhow::Error::new(
            crate::error::ArchiveError::Cancelled
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let retries_in = Arc::clone(&retries);
        let result = with_retry(
            move || {
                let calls = Arc::clone(&calls_in);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(anyhow::anyhow!("HTTP 503"))
                    } else {
                        Ok("done")
                    }
                }
            },
            2,
            2000,
            move |_, _| {
                let retries = Arc::clone(&retries_in);
                async move {
                    retries.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .await;

        assert_eq!(result.expect("eventually succeeds"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2, "exactly two retry warnings");
    }

    #[tokio::test]
    async fn non_transient_raises_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<()> = with_retry(
            move || {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("HTTP 404"))
                }
            },
            5,
            1,
            |_, _| async {},
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let result: Result<()> = with_retry(
            || async { Err(anyhow::Error::new(crate::error::ArchiveError::Cancelled)) },
            5,
            1,
            |_, _| async { panic!("cancellation must not retry") },
        )
        .await;
        assert!(crate::error::is_cancelled(&result.unwrap_err()));
    }
}
