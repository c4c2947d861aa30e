//! In-process mail store.
//!
//! [`MemoryConnector`] keeps mailboxes in memory and implements the
//! connector capability on top of them. It records every session and fetch
//! so callers can check exactly what a sync run asked the server for, and it
//! can inject failures and latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use super::{MailboxConnector, MailboxSession};
use crate::types::{Address, Envelope, MailboxStatus, Uid, UidValidity};
use crate::{Error, Result};

#[derive(Debug)]
struct Mailbox {
    uid_validity: UidValidity,
    messages: BTreeMap<Uid, Envelope>,
}

#[derive(Debug, Default)]
struct State {
    mailboxes: HashMap<String, Mailbox>,
    fail_connects: bool,
    fail_fetch_at: Option<usize>,
    fetch_delay: Option<Duration>,
    connects: usize,
    closes: usize,
    fetch_calls: usize,
    fetched_uids: Vec<u32>,
}

/// In-memory mail store shared by every session it opens.
///
/// Cloning is cheap and clones observe the same mailboxes and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<State>>,
}

impl MemoryConnector {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates (or replaces) an empty mailbox.
    pub fn add_mailbox(&self, name: &str, uid_validity: UidValidity) {
        self.state().mailboxes.insert(
            name.to_string(),
            Mailbox {
                uid_validity,
                messages: BTreeMap::new(),
            },
        );
    }

    /// Appends generated messages with the given UIDs to a mailbox.
    ///
    /// UIDs equal to 0 are skipped. Unknown mailboxes are ignored.
    pub fn add_messages(&self, name: &str, uids: impl IntoIterator<Item = u32>) {
        let mut state = self.state();
        if let Some(mailbox) = state.mailboxes.get_mut(name) {
            for uid in uids.into_iter().filter_map(Uid::new) {
                mailbox.messages.insert(uid, sample_envelope(uid));
            }
        }
    }

    /// Stores a specific envelope, replacing any message with the same UID.
    pub fn put_envelope(&self, name: &str, envelope: Envelope) {
        if let Some(mailbox) = self.state().mailboxes.get_mut(name) {
            mailbox.messages.insert(envelope.uid, envelope);
        }
    }

    /// Removes messages, as an expunge would.
    pub fn expunge(&self, name: &str, uids: impl IntoIterator<Item = u32>) {
        if let Some(mailbox) = self.state().mailboxes.get_mut(name) {
            for uid in uids.into_iter().filter_map(Uid::new) {
                mailbox.messages.remove(&uid);
            }
        }
    }

    /// Renumbers a mailbox: sets a new UIDVALIDITY and keeps the messages.
    pub fn set_uid_validity(&self, name: &str, uid_validity: UidValidity) {
        if let Some(mailbox) = self.state().mailboxes.get_mut(name) {
            mailbox.uid_validity = uid_validity;
        }
    }

    /// Makes every subsequent `connect` fail.
    pub fn fail_connects(&self, fail: bool) {
        self.state().fail_connects = fail;
    }

    /// Makes the `n`th fetch call (counting from 1, across all sessions) fail.
    pub fn fail_fetch_at(&self, n: usize) {
        self.state().fail_fetch_at = Some(n);
    }

    /// Delays every fetch call by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state().fetch_delay = Some(delay);
    }

    /// Removes all injected failures and latency.
    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.fail_connects = false;
        state.fail_fetch_at = None;
        state.fetch_delay = None;
    }

    /// Resets call accounting without touching mailbox contents.
    pub fn reset_counters(&self) {
        let mut state = self.state();
        state.connects = 0;
        state.closes = 0;
        state.fetch_calls = 0;
        state.fetched_uids.clear();
    }

    /// Number of sessions opened.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// Number of sessions closed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.state().closes
    }

    /// Number of fetch calls, failed ones included.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.state().fetch_calls
    }

    /// Every UID requested by a successful fetch call, in call order.
    #[must_use]
    pub fn fetched_uids(&self) -> Vec<u32> {
        self.state().fetched_uids.clone()
    }
}

impl MailboxConnector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession> {
        let mut state = self.state();
        if state.fail_connects {
            return Err(Error::Connection("connection refused".to_string()));
        }
        state.connects += 1;
        drop(state);

        Ok(MemorySession {
            store: self.clone(),
            selected: None,
        })
    }
}

/// Session opened by a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryConnector,
    selected: Option<String>,
}

impl MemorySession {
    fn selected(&self) -> Result<&str> {
        self.selected
            .as_deref()
            .ok_or_else(|| Error::Protocol("no mailbox selected".to_string()))
    }
}

impl MailboxSession for MemorySession {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let status = {
            let state = self.store.state();
            let found = state
                .mailboxes
                .get(mailbox)
                .ok_or_else(|| Error::Protocol(format!("mailbox not found: {mailbox}")))?;
            MailboxStatus {
                uid_validity: found.uid_validity,
                message_count: u32::try_from(found.messages.len()).unwrap_or(u32::MAX),
            }
        };
        self.selected = Some(mailbox.to_string());
        Ok(status)
    }

    async fn list_all_uids(&mut self) -> Result<Vec<Uid>> {
        let name = self.selected()?;
        let state = self.store.state();
        Ok(state
            .mailboxes
            .get(name)
            .map(|m| m.messages.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn fetch_envelopes(&mut self, uids: &[Uid]) -> Result<Vec<Envelope>> {
        let name = self.selected()?.to_string();

        let (call, delay) = {
            let mut state = self.store.state();
            state.fetch_calls += 1;
            (state.fetch_calls, state.fetch_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.store.state();
        if state.fail_fetch_at == Some(call) {
            return Err(Error::Connection(format!(
                "connection reset during fetch #{call}"
            )));
        }
        state.fetched_uids.extend(uids.iter().map(|u| u.get()));

        let envelopes = state
            .mailboxes
            .get(&name)
            .map(|m| {
                uids.iter()
                    .filter_map(|uid| m.messages.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(envelopes)
    }

    async fn close(self) -> Result<()> {
        self.store.state().closes += 1;
        Ok(())
    }
}

/// Builds a deterministic envelope for a generated message.
fn sample_envelope(uid: Uid) -> Envelope {
    let n = uid.get();
    let date: Option<DateTime<Utc>> = Utc
        .timestamp_opt(1_700_000_000 + i64::from(n) * 60, 0)
        .single();

    Envelope {
        uid,
        message_id: Some(format!("<{n}@example.com>")),
        in_reply_to: None,
        subject: format!("Message {n}"),
        from: vec![Address::named(format!("Sender {n}"), format!("sender{n}@example.com"))],
        to: vec![Address::new("me@example.com")],
        cc: Vec::new(),
        date: date.map(|d| d.fixed_offset()),
        flags: if n % 2 == 0 {
            vec!["\\Seen".to_string()]
        } else {
            Vec::new()
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn validity(n: u32) -> UidValidity {
        UidValidity::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_select_and_list() {
        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(7));
        store.add_messages("INBOX", [3, 1, 2]);

        let mut session = store.connect().await.unwrap();
        let status = session.select("INBOX").await.unwrap();
        assert_eq!(status.uid_validity, validity(7));
        assert_eq!(status.message_count, 3);

        let uids: Vec<u32> = session
            .list_all_uids()
            .await
            .unwrap()
            .into_iter()
            .map(Uid::get)
            .collect();
        assert_eq!(uids, vec![1, 2, 3]);

        session.close().await.unwrap();
        assert_eq!(store.connects(), 1);
        assert_eq!(store.closes(), 1);
    }

    #[tokio::test]
    async fn test_unknown_mailbox_is_protocol_error() {
        let store = MemoryConnector::new();
        let mut session = store.connect().await.unwrap();
        let err = session.select("Nope").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(matches!(
            session.list_all_uids().await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_skips_expunged() {
        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(1));
        store.add_messages("INBOX", 1..=5);
        store.expunge("INBOX", [4]);

        let mut session = store.connect().await.unwrap();
        session.select("INBOX").await.unwrap();
        let uids: Vec<Uid> = (3..=5).filter_map(Uid::new).collect();
        let envelopes = session.fetch_envelopes(&uids).await.unwrap();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].subject, "Message 3");
        assert_eq!(store.fetched_uids(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(1));
        store.add_messages("INBOX", 1..=3);

        store.fail_connects(true);
        assert!(matches!(store.connect().await, Err(Error::Connection(_))));
        store.clear_faults();

        store.fail_fetch_at(2);
        let mut session = store.connect().await.unwrap();
        session.select("INBOX").await.unwrap();
        let one = [Uid::new(1).unwrap()];
        assert!(session.fetch_envelopes(&one).await.is_ok());
        assert!(session.fetch_envelopes(&one).await.is_err());
        assert!(session.fetch_envelopes(&one).await.is_ok());
        assert_eq!(store.fetch_calls(), 3);
        assert_eq!(store.fetched_uids(), vec![1, 1]);
    }
}
