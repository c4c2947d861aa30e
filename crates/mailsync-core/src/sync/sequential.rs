//! Single-session batched fetch.

use tracing::debug;

use super::progress::Reporter;
use super::{BATCH_SIZE, FetchJob, FetchReport, close_session};
use crate::Result;
use crate::cache::CacheRepository;
use crate::connector::MailboxSession;
use crate::types::max_uid;

/// Fetches the job's UIDs over `session`, checkpointing after every batch.
///
/// The session is closed before returning.
pub(crate) async fn fetch<S: MailboxSession>(
    cache: &CacheRepository,
    mut session: S,
    job: &FetchJob,
    progress: &Reporter,
) -> FetchReport {
    let mut committed = 0;
    let outcome = fetch_batches(cache, &mut session, job, progress, &mut committed).await;
    close_session(session).await;

    FetchReport {
        committed,
        error: outcome.err(),
    }
}

async fn fetch_batches<S: MailboxSession>(
    cache: &CacheRepository,
    session: &mut S,
    job: &FetchJob,
    progress: &Reporter,
    committed: &mut usize,
) -> Result<()> {
    let total = job.uids.len();
    let mut fetched = 0;
    let mut highest: u32 = 0;

    for batch in job.uids.chunks(BATCH_SIZE) {
        let envelopes = session.fetch_envelopes(batch).await?;

        if !envelopes.is_empty() {
            *committed += cache
                .insert_envelopes(&job.mailbox, job.uid_validity, &envelopes)
                .await?;
            highest = highest.max(max_uid(&envelopes));
            cache
                .update_mailbox_state(&job.mailbox, job.uid_validity, highest)
                .await?;
            debug!(
                mailbox = %job.mailbox,
                batch = envelopes.len(),
                last_synced_uid = highest,
                "Committed batch"
            );
        }

        fetched += envelopes.len();
        progress.report_progress(fetched, total);
    }

    Ok(())
}
