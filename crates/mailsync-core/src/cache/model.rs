//! Cache data models.

use chrono::{DateTime, Utc};

use crate::types::{Envelope, UidValidity};

/// Sync checkpoint for one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxSyncState {
    /// Epoch the cached envelopes belong to.
    pub uid_validity: UidValidity,
    /// Highest UID durably committed, 0 if none.
    pub last_synced_uid: u32,
    /// When the checkpoint was last written.
    pub updated_at: DateTime<Utc>,
}

/// Sync state together with the mailbox it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxSummary {
    /// Mailbox name.
    pub mailbox: String,
    /// Stored checkpoint.
    pub state: MailboxSyncState,
    /// Number of cached envelopes.
    pub envelope_count: usize,
}

/// An envelope read back from the cache.
#[derive(Debug, Clone)]
pub struct CachedEnvelope {
    /// Mailbox the envelope was synced from.
    pub mailbox: String,
    /// Epoch the UID belongs to.
    pub uid_validity: UidValidity,
    /// The envelope itself.
    pub envelope: Envelope,
    /// When the envelope was cached.
    pub cached_at: DateTime<Utc>,
}
