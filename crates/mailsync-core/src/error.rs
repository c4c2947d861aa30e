//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport or session failure talking to the mail store.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected response from the mail store.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Local cache read or write failed.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fetch worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Task(String),
}

impl Error {
    /// Returns true if the error originated in the local cache.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A failed sync run.
///
/// Displays as the underlying error. `committed` counts the envelopes that
/// were durably written to the cache before the failure; a later sync skips
/// them.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct SyncError {
    /// Mailbox being synchronized.
    pub mailbox: String,
    /// Envelopes committed to the cache before the failure.
    pub committed: usize,
    /// The error that stopped the run.
    pub source: Error,
}

impl SyncError {
    /// Wraps an error that aborted the run before anything was committed.
    pub fn aborted(mailbox: impl Into<String>, source: impl Into<Error>) -> Self {
        Self {
            mailbox: mailbox.into(),
            committed: 0,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_displays_source_verbatim() {
        let err = SyncError {
            mailbox: "INBOX".to_string(),
            committed: 1000,
            source: Error::Connection("connection reset by peer".to_string()),
        };
        assert_eq!(err.to_string(), "Connection error: connection reset by peer");
        assert_eq!(err.committed, 1000);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_aborted_has_no_committed_messages() {
        let err = SyncError::aborted("Archive", Error::Protocol("bad UIDVALIDITY".into()));
        assert_eq!(err.committed, 0);
        assert_eq!(err.mailbox, "Archive");
        assert!(!err.source.is_store());
    }
}
