//! Envelope cache.
//!
//! Durable per-mailbox sync checkpoints and the envelope records they
//! cover, stored in `SQLite`.

mod model;
mod repository;

pub use model::{CachedEnvelope, MailboxSummary, MailboxSyncState};
pub use repository::CacheRepository;
