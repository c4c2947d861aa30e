//! # mailsync-core
//!
//! Mailbox synchronization engine.
//!
//! This crate provides:
//! - **Envelope cache** - `SQLite` store of envelopes and per-mailbox sync
//!   checkpoints
//! - **Connector capability** - the mail store operations the engine needs,
//!   plus an in-memory store
//! - **Sync orchestrator** - UIDVALIDITY handling, missing-UID diff and
//!   strategy selection
//! - **Fetch strategies** - single-session batches or a worker pool feeding
//!   one cache writer, both checkpointing as they go
//! - **Configuration** - JSON settings for cache location and concurrency

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod connector;
mod error;
pub mod sync;
pub mod types;

pub use cache::{CacheRepository, CachedEnvelope, MailboxSummary, MailboxSyncState};
pub use config::SyncConfig;
pub use connector::{MailboxConnector, MailboxSession, MemoryConnector};
pub use error::{Error, Result, SyncError};
pub use sync::{ProgressSink, SyncOptions, SyncResult, Synchronizer};
pub use types::{Address, Envelope, MailboxStatus, Uid, UidValidity};
