//! Multi-session fetch with a single cache writer.
//!
//! The missing UIDs are split into contiguous shares, one per worker. Each
//! worker owns a session and pushes fetched batches into a bounded queue.
//! The calling task drains the queue and is the only one touching the cache.
//!
//! After the first error the writer keeps draining but stops writing, and
//! workers are left to finish on their own so no session is dropped in the
//! middle of a command.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::progress::Reporter;
use super::{
    BATCH_SIZE, CHECKPOINT_INTERVAL, FetchJob, FetchReport, SyncOptions, close_session,
};
use crate::cache::CacheRepository;
use crate::connector::{MailboxConnector, MailboxSession};
use crate::types::{Envelope, Uid, max_uid};
use crate::{Error, Result};

type Batch = Result<Vec<Envelope>>;

/// Number of workers worth starting for `missing` UIDs.
pub(crate) fn worker_count(configured: usize, missing: usize) -> usize {
    configured.min(missing.div_ceil(BATCH_SIZE)).max(1)
}

/// Splits `items` into `shares` contiguous slices whose lengths differ by at
/// most one, longer slices first.
pub(crate) fn partition<T>(items: &[T], shares: usize) -> Vec<&[T]> {
    let shares = shares.max(1);
    let base = items.len() / shares;
    let extra = items.len() % shares;

    let mut out = Vec::with_capacity(shares);
    let mut rest = items;
    for i in 0..shares {
        let len = base + usize::from(i < extra);
        let (share, tail) = rest.split_at(len);
        out.push(share);
        rest = tail;
    }
    out
}

/// Fetches the job's UIDs with up to `options.workers` sessions.
pub(crate) async fn fetch<C: MailboxConnector>(
    cache: &CacheRepository,
    connector: Arc<C>,
    job: &FetchJob,
    options: &SyncOptions,
    progress: &Reporter,
) -> FetchReport {
    let total = job.uids.len();
    let workers = worker_count(options.workers, total);
    debug!(mailbox = %job.mailbox, workers, total, "Starting parallel fetch");

    let (tx, mut rx) = mpsc::channel::<Batch>(workers * 2);
    let fetched = Arc::new(AtomicUsize::new(0));

    let ticker = progress.is_enabled().then(|| {
        spawn_ticker(
            progress.clone(),
            Arc::clone(&fetched),
            total,
            options.progress_interval,
        )
    });

    let mut tasks = JoinSet::new();
    for (index, share) in partition(&job.uids, workers).into_iter().enumerate() {
        if share.is_empty() {
            continue;
        }
        tasks.spawn(run_worker(
            Arc::clone(&connector),
            job.mailbox.clone(),
            share.to_vec(),
            tx.clone(),
            Arc::clone(&fetched),
            index,
        ));
    }
    drop(tx);

    let mut writer = Writer::new(cache, job);
    while let Some(batch) = rx.recv().await {
        writer.consume(batch).await;
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            writer.record(Error::Task(e.to_string()));
        }
    }

    if let Some((stop, handle)) = ticker {
        let _ = stop.send(());
        let _ = handle.await;
    }
    progress.report_progress(fetched.load(Ordering::Relaxed), total);

    writer.finish().await
}

/// Step at which a worker gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connect,
    Select,
    Fetch,
}

impl Stage {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Select => "select",
            Self::Fetch => "fetch",
        }
    }
}

/// One worker: own session, own share, batches pushed to the writer.
async fn run_worker<C: MailboxConnector>(
    connector: Arc<C>,
    mailbox: String,
    uids: Vec<Uid>,
    tx: mpsc::Sender<Batch>,
    fetched: Arc<AtomicUsize>,
    index: usize,
) {
    let mut session = match connector.connect().await {
        Ok(session) => session,
        Err(e) => {
            warn!(
                worker = index,
                stage = Stage::Connect.as_str(),
                error = %e,
                "Worker stopped"
            );
            let _ = tx.send(Err(e)).await;
            return;
        }
    };

    if let Err((stage, e)) = fetch_share(&mut session, &mailbox, &uids, &tx, &fetched).await {
        warn!(
            worker = index,
            stage = stage.as_str(),
            share = uids.len(),
            error = %e,
            "Worker stopped"
        );
        let _ = tx.send(Err(e)).await;
    }
    close_session(session).await;
    debug!(worker = index, share = uids.len(), "Worker finished");
}

async fn fetch_share<S: MailboxSession>(
    session: &mut S,
    mailbox: &str,
    uids: &[Uid],
    tx: &mpsc::Sender<Batch>,
    fetched: &AtomicUsize,
) -> std::result::Result<(), (Stage, Error)> {
    session
        .select(mailbox)
        .await
        .map_err(|e| (Stage::Select, e))?;

    for batch in uids.chunks(BATCH_SIZE) {
        let envelopes = session
            .fetch_envelopes(batch)
            .await
            .map_err(|e| (Stage::Fetch, e))?;
        let count = envelopes.len();
        if tx.send(Ok(envelopes)).await.is_err() {
            // Writer is gone; nothing left to deliver to.
            break;
        }
        fetched.fetch_add(count, Ordering::Relaxed);
    }

    Ok(())
}

/// Reports the shared fetch counter every `every` until told to stop.
fn spawn_ticker(
    progress: Reporter,
    fetched: Arc<AtomicUsize>,
    total: usize,
    every: Duration,
) -> (oneshot::Sender<()>, JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    progress.report_progress(fetched.load(Ordering::Relaxed), total);
                }
            }
        }
    });

    (stop_tx, handle)
}

/// Serializes all cache writes of a parallel run.
struct Writer<'a> {
    cache: &'a CacheRepository,
    job: &'a FetchJob,
    committed: usize,
    highest: u32,
    since_checkpoint: usize,
    error: Option<Error>,
}

impl<'a> Writer<'a> {
    const fn new(cache: &'a CacheRepository, job: &'a FetchJob) -> Self {
        Self {
            cache,
            job,
            committed: 0,
            highest: 0,
            since_checkpoint: 0,
            error: None,
        }
    }

    /// Keeps the first error; later ones are only logged.
    fn record(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        } else {
            debug!(error = %error, "Discarding error after first failure");
        }
    }

    async fn consume(&mut self, batch: Batch) {
        let envelopes = match batch {
            Ok(envelopes) => envelopes,
            Err(e) => {
                self.record(e);
                return;
            }
        };
        if self.error.is_some() || envelopes.is_empty() {
            return;
        }

        match self
            .cache
            .insert_envelopes(&self.job.mailbox, self.job.uid_validity, &envelopes)
            .await
        {
            Ok(inserted) => self.committed += inserted,
            Err(e) => {
                self.record(e);
                return;
            }
        }
        self.highest = self.highest.max(max_uid(&envelopes));
        self.since_checkpoint += 1;

        if self.since_checkpoint >= CHECKPOINT_INTERVAL
            && let Err(e) = self.checkpoint().await
        {
            self.record(e);
        }
    }

    async fn checkpoint(&mut self) -> Result<()> {
        self.since_checkpoint = 0;
        if self.highest == 0 {
            return Ok(());
        }
        self.cache
            .update_mailbox_state(&self.job.mailbox, self.job.uid_validity, self.highest)
            .await?;
        debug!(
            mailbox = %self.job.mailbox,
            last_synced_uid = self.highest,
            committed = self.committed,
            "Checkpoint"
        );
        Ok(())
    }

    /// Writes the final checkpoint unless the cache itself failed.
    async fn finish(mut self) -> FetchReport {
        let store_failed = self.error.as_ref().is_some_and(Error::is_store);
        if !store_failed && let Err(e) = self.checkpoint().await {
            self.record(e);
        }

        FetchReport {
            committed: self.committed,
            error: self.error,
        }
    }
}
