//! Mailbox synchronization.
//!
//! [`Synchronizer::sync`] reconciles the envelope cache with one remote
//! mailbox:
//!
//! 1. select the mailbox and compare its UIDVALIDITY with the cached
//!    checkpoint, clearing the cache on an epoch change;
//! 2. diff the remote UID list against the cached UIDs;
//! 3. fetch the missing envelopes in batches of [`BATCH_SIZE`], either over
//!    the orchestrator's own session or, for large backlogs, over a pool of
//!    independent sessions feeding a single cache writer.
//!
//! Every committed batch advances the checkpoint, so an interrupted run
//! loses at most the batches that were in flight.

mod parallel;
mod progress;
mod sequential;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::CacheRepository;
use crate::connector::{MailboxConnector, MailboxSession};
use crate::types::{Uid, UidValidity};
use crate::{Error, Result, SyncError};

pub use progress::ProgressSink;
use progress::Reporter;

/// Number of UIDs fetched and committed together.
pub const BATCH_SIZE: usize = 500;

/// Backlogs larger than this use the parallel fetcher when more than one
/// worker is configured.
pub const PARALLEL_THRESHOLD: usize = 100;

/// The parallel writer checkpoints after this many committed batches.
pub const CHECKPOINT_INTERVAL: usize = 10;

/// Default period of parallel progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Options for one sync run.
#[derive(Clone)]
pub struct SyncOptions {
    /// Maximum number of concurrent fetch sessions.
    pub workers: usize,
    /// Where progress lines go, if anywhere.
    pub progress: Option<Arc<dyn ProgressSink>>,
    /// How often the parallel fetcher reports progress.
    pub progress_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            progress: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl std::fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("workers", &self.workers)
            .field("progress", &self.progress.is_some())
            .field("progress_interval", &self.progress_interval)
            .finish()
    }
}

impl SyncOptions {
    /// Sets the worker count. Zero is treated as one.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Sets the parallel progress period.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Summary of a successful sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// Mailbox that was synchronized.
    pub mailbox: String,
    /// Envelopes added to the cache by this run.
    pub new_messages: usize,
    /// Envelopes cached for the mailbox after this run.
    pub total_cached: usize,
    /// Human-readable outcome.
    pub message: String,
}

/// Missing UIDs of one mailbox and the epoch they belong to.
#[derive(Debug)]
pub(crate) struct FetchJob {
    pub(crate) mailbox: String,
    pub(crate) uid_validity: UidValidity,
    pub(crate) uids: Vec<Uid>,
}

/// What a fetch strategy achieved.
#[derive(Debug)]
pub(crate) struct FetchReport {
    /// Envelopes durably written.
    pub(crate) committed: usize,
    /// First error encountered, if the run did not complete.
    pub(crate) error: Option<Error>,
}

/// Result of comparing the cache with the server.
enum Plan {
    /// Nothing to fetch.
    Finished(SyncResult),
    /// Fetch the job's UIDs on top of `cached` envelopes.
    Fetch { job: FetchJob, cached: usize },
}

/// Keeps one mailbox store and one cache location in sync.
pub struct Synchronizer<C> {
    connector: Arc<C>,
    database_path: PathBuf,
}

impl<C: MailboxConnector> Synchronizer<C> {
    /// Binds a connector to the cache database at `database_path`.
    pub fn new(connector: C, database_path: impl Into<PathBuf>) -> Self {
        Self {
            connector: Arc::new(connector),
            database_path: database_path.into(),
        }
    }

    /// Path of the cache database.
    #[must_use]
    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Synchronizes `mailbox` into the cache.
    ///
    /// The cache is opened for the duration of the run and closed on every
    /// exit path.
    ///
    /// # Errors
    ///
    /// Returns the first connector or store error. The error carries the
    /// number of envelopes committed before it; running `sync` again resumes
    /// from there.
    pub async fn sync(
        &self,
        mailbox: &str,
        options: &SyncOptions,
    ) -> std::result::Result<SyncResult, SyncError> {
        let cache = CacheRepository::open(&self.database_path)
            .await
            .map_err(|e| SyncError::aborted(mailbox, e))?;

        let outcome = self.sync_with_cache(&cache, mailbox, options).await;
        cache.close().await;
        outcome
    }

    /// Synchronizes `mailbox` through an already open cache handle.
    ///
    /// # Errors
    ///
    /// Same as [`sync`](Self::sync).
    pub async fn sync_with_cache(
        &self,
        cache: &CacheRepository,
        mailbox: &str,
        options: &SyncOptions,
    ) -> std::result::Result<SyncResult, SyncError> {
        let progress = Reporter::new(options.progress.clone());

        let mut session = self
            .connector
            .connect()
            .await
            .map_err(|e| SyncError::aborted(mailbox, e))?;

        let plan = match plan(cache, &mut session, mailbox, &progress).await {
            Ok(plan) => plan,
            Err(e) => {
                close_session(session).await;
                return Err(SyncError::aborted(mailbox, e));
            }
        };

        let (job, cached) = match plan {
            Plan::Finished(result) => {
                close_session(session).await;
                info!(mailbox, message = %result.message, "Sync finished");
                return Ok(result);
            }
            Plan::Fetch { job, cached } => (job, cached),
        };

        let report = if options.workers > 1 && job.uids.len() > PARALLEL_THRESHOLD {
            close_session(session).await;
            parallel::fetch(cache, Arc::clone(&self.connector), &job, options, &progress).await
        } else {
            sequential::fetch(cache, session, &job, &progress).await
        };

        if let Some(error) = report.error {
            warn!(
                mailbox,
                committed = report.committed,
                error = %error,
                "Sync interrupted"
            );
            return Err(SyncError {
                mailbox: mailbox.to_string(),
                committed: report.committed,
                source: error,
            });
        }

        let new_messages = report.committed;
        let message = if new_messages == 0 {
            "already up to date".to_string()
        } else {
            format!("synced {new_messages} new messages")
        };
        info!(mailbox, new_messages, "Sync finished");

        Ok(SyncResult {
            mailbox: mailbox.to_string(),
            new_messages,
            total_cached: cached + new_messages,
            message,
        })
    }
}

/// Selects the mailbox, handles epoch changes and computes the missing UIDs.
async fn plan<S: MailboxSession>(
    cache: &CacheRepository,
    session: &mut S,
    mailbox: &str,
    progress: &Reporter,
) -> Result<Plan> {
    let status = session.select(mailbox).await?;
    debug!(
        mailbox,
        uid_validity = status.uid_validity.get(),
        messages = status.message_count,
        "Selected mailbox"
    );

    // Envelopes committed before the first checkpoint have no state row, so
    // the rows themselves are checked as well.
    let checkpoint = cache.get_mailbox_state(mailbox).await?;
    let epoch_changed = checkpoint
        .as_ref()
        .is_some_and(|state| state.uid_validity != status.uid_validity)
        || cache.has_other_epochs(mailbox, status.uid_validity).await?;

    if epoch_changed {
        info!(
            mailbox,
            cached = checkpoint.map(|s| s.uid_validity.get()),
            server = status.uid_validity.get(),
            "UIDVALIDITY changed, discarding cached envelopes"
        );
        cache.clear_mailbox(mailbox).await?;
    }

    if status.message_count == 0 {
        cache
            .update_mailbox_state(mailbox, status.uid_validity, 0)
            .await?;
        return Ok(Plan::Finished(SyncResult {
            mailbox: mailbox.to_string(),
            new_messages: 0,
            total_cached: cache.count_envelopes(mailbox).await?,
            message: "mailbox is empty".to_string(),
        }));
    }

    let cached = cache
        .get_cached_uids(mailbox, status.uid_validity)
        .await?;

    progress.report("Checking for new messages...");
    let remote = session.list_all_uids().await?;

    let missing: Vec<Uid> = remote
        .iter()
        .copied()
        .filter(|uid| !cached.contains(uid))
        .collect();

    if missing.is_empty() {
        if let Some(max) = remote.iter().max() {
            cache
                .update_mailbox_state(mailbox, status.uid_validity, max.get())
                .await?;
        }
        return Ok(Plan::Finished(SyncResult {
            mailbox: mailbox.to_string(),
            new_messages: 0,
            total_cached: cached.len(),
            message: "already up to date".to_string(),
        }));
    }

    debug!(
        mailbox,
        remote = remote.len(),
        cached = cached.len(),
        missing = missing.len(),
        "Computed missing UIDs"
    );
    progress.report(&format!("Found {} messages to sync", missing.len()));

    Ok(Plan::Fetch {
        job: FetchJob {
            mailbox: mailbox.to_string(),
            uid_validity: status.uid_validity,
            uids: missing,
        },
        cached: cached.len(),
    })
}

/// Ends a session, logging rather than propagating a failed logout.
pub(crate) async fn close_session<S: MailboxSession>(session: S) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close mail store session");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::connector::MemoryConnector;
    use crate::types::Envelope;

    fn validity(n: u32) -> UidValidity {
        UidValidity::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_mailbox_sequential() {
        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(11));
        store.add_messages("INBOX", 1..=42);

        let cache = CacheRepository::in_memory().await.unwrap();
        let sync = Synchronizer::new(store.clone(), "unused.db");

        let result = sync
            .sync_with_cache(&cache, "INBOX", &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(result.new_messages, 42);
        assert_eq!(result.total_cached, 42);
        assert_eq!(result.message, "synced 42 new messages");

        let state = cache.get_mailbox_state("INBOX").await.unwrap().unwrap();
        assert_eq!(state.uid_validity, validity(11));
        assert_eq!(state.last_synced_uid, 42);

        // The orchestrator's own session did the fetching.
        assert_eq!(store.connects(), 1);
        assert_eq!(store.closes(), 1);
    }

    #[tokio::test]
    async fn test_small_backlog_stays_sequential_with_workers() {
        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(1));
        store.add_messages("INBOX", 1..=100);

        let cache = CacheRepository::in_memory().await.unwrap();
        let sync = Synchronizer::new(store.clone(), "unused.db");
        let options = SyncOptions::default().with_workers(8);

        let result = sync.sync_with_cache(&cache, "INBOX", &options).await.unwrap();
        assert_eq!(result.new_messages, 100);
        assert_eq!(store.connects(), 1);
    }

    #[tokio::test]
    async fn test_progress_lines() {
        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(1));
        store.add_messages("INBOX", 1..=1200);

        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        let options = SyncOptions::default().with_progress(Arc::new(move |line: &str| {
            captured.lock().unwrap().push(line.to_string());
        }));

        let cache = CacheRepository::in_memory().await.unwrap();
        Synchronizer::new(store, "unused.db")
            .sync_with_cache(&cache, "INBOX", &options)
            .await
            .unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                "Checking for new messages...".to_string(),
                "Found 1200 messages to sync".to_string(),
                "Syncing: 500 / 1200 messages (41.7%)".to_string(),
                "Syncing: 1000 / 1200 messages (83.3%)".to_string(),
                "Syncing: 1200 / 1200 messages (100.0%)".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_surfaced() {
        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(1));
        store.fail_connects(true);

        let cache = CacheRepository::in_memory().await.unwrap();
        let err = Synchronizer::new(store, "unused.db")
            .sync_with_cache(&cache, "INBOX", &SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.source, Error::Connection(_)));
        assert_eq!(err.committed, 0);
        assert_eq!(err.to_string(), "Connection error: connection refused");
    }

    #[tokio::test]
    async fn test_select_failure_closes_session() {
        let store = MemoryConnector::new();

        let cache = CacheRepository::in_memory().await.unwrap();
        let err = Synchronizer::new(store.clone(), "unused.db")
            .sync_with_cache(&cache, "Missing", &SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.source, Error::Protocol(_)));
        assert_eq!(store.connects(), 1);
        assert_eq!(store.closes(), 1);
    }

    #[tokio::test]
    async fn test_expunged_messages_are_not_counted() {
        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(1));
        store.add_messages("INBOX", 1..=10);

        let cache = CacheRepository::in_memory().await.unwrap();
        let sync = Synchronizer::new(store.clone(), "unused.db");
        sync.sync_with_cache(&cache, "INBOX", &SyncOptions::default())
            .await
            .unwrap();

        // A message removed on the server stays cached: the cache is append-only.
        store.expunge("INBOX", [3]);
        store.add_messages("INBOX", [11]);
        let result = sync
            .sync_with_cache(&cache, "INBOX", &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(result.new_messages, 1);
        assert_eq!(cache.count_envelopes("INBOX").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_uncheckpointed_envelopes_from_old_epoch_are_discarded() {
        let cache = CacheRepository::in_memory().await.unwrap();
        let stale: Vec<Envelope> = (1..=10)
            .map(|n| Envelope::new(Uid::new(n).unwrap(), format!("old {n}")))
            .collect();
        cache
            .insert_envelopes("INBOX", validity(1), &stale)
            .await
            .unwrap();
        assert!(cache.get_mailbox_state("INBOX").await.unwrap().is_none());

        let store = MemoryConnector::new();
        store.add_mailbox("INBOX", validity(2));
        store.add_messages("INBOX", 1..=10);

        let result = Synchronizer::new(store.clone(), "unused.db")
            .sync_with_cache(&cache, "INBOX", &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(result.new_messages, 10);
        assert_eq!(result.total_cached, 10);
        assert_eq!(store.fetch_calls(), 1);

        let cached = cache.get_envelopes("INBOX", u32::MAX).await.unwrap();
        assert_eq!(cached.len(), 10);
        assert!(cached.iter().all(|c| c.uid_validity == validity(2)));
        assert!(cached.iter().all(|c| c.envelope.subject.starts_with("Message ")));

        let state = cache.get_mailbox_state("INBOX").await.unwrap().unwrap();
        assert_eq!(state.uid_validity, validity(2));
        assert_eq!(state.last_synced_uid, 10);
    }
}
