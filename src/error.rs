//! Error taxonomy for archive operations.
//!
//! Cancellation is modelled as an ordinary error with a fixed message so it
//! can cross `anyhow` boundaries and still be recognized at the worker pool,
//! the retry wrapper and the job processor.

use thiserror::Error;

/// Message carried by every cancellation error. Matched by substring when the
/// error has been flattened through `anyhow`.
pub const CANCELLED_MESSAGE: &str = "Crawl cancelled by request.";

/// Errors surfaced by crawl and job operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Crawl cancelled by request.")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for ArchiveError {
    fn from(err: anyhow::Error) -> Self {
        if is_cancelled(&err) {
            return Self::Cancelled;
        }
        // {:#} keeps the full context chain
        Self::Other(format!("{err:#}"))
    }
}

/// True when the error (or anything in its chain) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    format!("{err:#}").contains(CANCELLED_MESSAGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn cancellation_survives_context_wrapping() {
        let err: anyhow::Error = anyhow::Error::new(ArchiveError::Cancelled)
            .context("processing https://example.com/pricing");
        assert!(is_cancelled(&err));
    }

    #[test]
    fn plain_errors_are_not_cancellation() {
        let err = anyhow::anyhow!("HTTP 503 from origin").context("fetch");
        assert!(!is_cancelled(&err));
    }
}
