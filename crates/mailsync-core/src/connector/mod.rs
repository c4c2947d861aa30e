//! Mail store capability consumed by the sync engine.
//!
//! The engine never speaks a wire protocol itself. It asks a
//! [`MailboxConnector`] for sessions and drives them through
//! select, list and fetch calls. Each session is owned by exactly one task;
//! the parallel fetcher opens one session per worker.

pub mod memory;

use std::future::Future;

use crate::Result;
use crate::types::{Envelope, MailboxStatus, Uid};

/// Opens sessions against a mail store.
pub trait MailboxConnector: Send + Sync + 'static {
    /// Session type produced by [`connect`](Self::connect).
    type Session: MailboxSession;

    /// Opens and authenticates a new session.
    fn connect(&self) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// One connection to the mail store.
pub trait MailboxSession: Send + 'static {
    /// Selects a mailbox, returning its UIDVALIDITY and message count.
    fn select(&mut self, mailbox: &str) -> impl Future<Output = Result<MailboxStatus>> + Send;

    /// Lists every UID in the selected mailbox in ascending order.
    fn list_all_uids(&mut self) -> impl Future<Output = Result<Vec<Uid>>> + Send;

    /// Fetches envelopes for the given UIDs.
    ///
    /// UIDs that no longer exist on the server are silently absent from the
    /// result.
    fn fetch_envelopes(&mut self, uids: &[Uid])
    -> impl Future<Output = Result<Vec<Envelope>>> + Send;

    /// Ends the session.
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

pub use memory::{MemoryConnector, MemorySession};
