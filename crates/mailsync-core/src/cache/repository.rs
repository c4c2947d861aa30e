//! Envelope cache storage repository.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use tracing::debug;

use super::model::{CachedEnvelope, MailboxSummary, MailboxSyncState};
use crate::Result;
use crate::types::{Address, Envelope, Uid, UidValidity};

/// Handle to the envelope cache.
///
/// A handle is opened at the start of a sync run and closed at its end. Only
/// one task writes through it at a time.
pub struct CacheRepository {
    pool: SqlitePool,
}

impl CacheRepository {
    /// Open (creating if needed) the cache database at `database_path`.
    ///
    /// Writes are synchronous: a checkpoint is on disk when the call returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn open(database_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        debug!(path = %database_path.display(), "Opened envelope cache");
        let repo = Self { pool };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Create an in-memory repository for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let repo = Self { pool };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Release the handle, waiting for pending writes to finish.
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS mailbox_state (
                mailbox TEXT PRIMARY KEY,
                uid_validity INTEGER NOT NULL,
                last_synced_uid INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS envelopes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mailbox TEXT NOT NULL,
                uid_validity INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT,
                in_reply_to TEXT,
                subject TEXT NOT NULL DEFAULT '',
                from_json TEXT NOT NULL DEFAULT '[]',
                to_json TEXT NOT NULL DEFAULT '[]',
                cc_json TEXT NOT NULL DEFAULT '[]',
                date TEXT,
                flags_json TEXT NOT NULL DEFAULT '[]',
                cached_at TEXT NOT NULL,
                UNIQUE(mailbox, uid_validity, uid)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_envelopes_mailbox
            ON envelopes(mailbox, uid)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the sync checkpoint of a mailbox, if it was ever synced.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_mailbox_state(&self, mailbox: &str) -> Result<Option<MailboxSyncState>> {
        let row = sqlx::query(
            r"
            SELECT uid_validity, last_synced_uid, updated_at
            FROM mailbox_state
            WHERE mailbox = ?
            ",
        )
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await?;

        row.map_or(Ok(None), |row| decode_state(&row))
    }

    /// Delete every envelope and the checkpoint of a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn clear_mailbox(&self, mailbox: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(r"DELETE FROM envelopes WHERE mailbox = ?")
            .bind(mailbox)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(r"DELETE FROM mailbox_state WHERE mailbox = ?")
            .bind(mailbox)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(mailbox, removed, "Cleared cached mailbox");
        Ok(())
    }

    /// Check whether a mailbox holds envelopes from an epoch other than
    /// `uid_validity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn has_other_epochs(&self, mailbox: &str, uid_validity: UidValidity) -> Result<bool> {
        let row = sqlx::query(
            r"
            SELECT EXISTS(
                SELECT 1 FROM envelopes WHERE mailbox = ? AND uid_validity != ?
            ) as stale
            ",
        )
        .bind(mailbox)
        .bind(uid_validity.get())
        .fetch_one(&self.pool)
        .await?;

        let stale: i64 = row.try_get("stale")?;
        Ok(stale != 0)
    }

    /// Get the UIDs of every envelope cached for a mailbox under `uid_validity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_cached_uids(
        &self,
        mailbox: &str,
        uid_validity: UidValidity,
    ) -> Result<HashSet<Uid>> {
        let rows = sqlx::query(r"SELECT uid FROM envelopes WHERE mailbox = ? AND uid_validity = ?")
            .bind(mailbox)
            .bind(uid_validity.get())
            .fetch_all(&self.pool)
            .await?;

        let mut uids = HashSet::with_capacity(rows.len());
        for row in &rows {
            if let Some(uid) = Uid::new(row.try_get::<u32, _>("uid")?) {
                uids.insert(uid);
            }
        }
        Ok(uids)
    }

    /// Insert a batch of envelopes in one transaction.
    ///
    /// Envelopes already cached under the same `(mailbox, uid_validity, uid)`
    /// are left untouched. Returns the number of rows actually added.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the database query fails. On
    /// error nothing from the batch is stored.
    pub async fn insert_envelopes(
        &self,
        mailbox: &str,
        uid_validity: UidValidity,
        envelopes: &[Envelope],
    ) -> Result<usize> {
        let cached_at = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for envelope in envelopes {
            let added = sqlx::query(
                r"
                INSERT INTO envelopes
                    (mailbox, uid_validity, uid, message_id, in_reply_to, subject,
                     from_json, to_json, cc_json, date, flags_json, cached_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(mailbox, uid_validity, uid) DO NOTHING
                ",
            )
            .bind(mailbox)
            .bind(uid_validity.get())
            .bind(envelope.uid.get())
            .bind(&envelope.message_id)
            .bind(&envelope.in_reply_to)
            .bind(&envelope.subject)
            .bind(serde_json::to_string(&envelope.from)?)
            .bind(serde_json::to_string(&envelope.to)?)
            .bind(serde_json::to_string(&envelope.cc)?)
            .bind(envelope.date.map(|d| d.to_rfc3339()))
            .bind(serde_json::to_string(&envelope.flags)?)
            .bind(&cached_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            inserted += usize::try_from(added).unwrap_or(0);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Write the sync checkpoint of a mailbox.
    ///
    /// Within one epoch the stored `last_synced_uid` never decreases: writing
    /// an equal or lower value leaves the row untouched. A different
    /// `uid_validity` replaces the checkpoint outright.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_mailbox_state(
        &self,
        mailbox: &str,
        uid_validity: UidValidity,
        last_uid: u32,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO mailbox_state (mailbox, uid_validity, last_synced_uid, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(mailbox) DO UPDATE SET
                uid_validity = excluded.uid_validity,
                last_synced_uid = excluded.last_synced_uid,
                updated_at = excluded.updated_at
            WHERE mailbox_state.uid_validity != excluded.uid_validity
               OR mailbox_state.last_synced_uid < excluded.last_synced_uid
            ",
        )
        .bind(mailbox)
        .bind(uid_validity.get())
        .bind(last_uid)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count cached envelopes in a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count_envelopes(&self, mailbox: &str) -> Result<usize> {
        let row = sqlx::query(r"SELECT COUNT(*) as count FROM envelopes WHERE mailbox = ?")
            .bind(mailbox)
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.try_get("count")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Get up to `limit` cached envelopes of a mailbox, highest UID first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query or decoding fails.
    pub async fn get_envelopes(&self, mailbox: &str, limit: u32) -> Result<Vec<CachedEnvelope>> {
        let rows = sqlx::query(
            r"
            SELECT mailbox, uid_validity, uid, message_id, in_reply_to, subject,
                   from_json, to_json, cc_json, date, flags_json, cached_at
            FROM envelopes
            WHERE mailbox = ?
            ORDER BY uid DESC
            LIMIT ?
            ",
        )
        .bind(mailbox)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(envelope) = decode_envelope(row)? {
                envelopes.push(envelope);
            }
        }
        Ok(envelopes)
    }

    /// Get one cached envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query or decoding fails.
    pub async fn get_envelope(&self, mailbox: &str, uid: Uid) -> Result<Option<CachedEnvelope>> {
        let row = sqlx::query(
            r"
            SELECT mailbox, uid_validity, uid, message_id, in_reply_to, subject,
                   from_json, to_json, cc_json, date, flags_json, cached_at
            FROM envelopes
            WHERE mailbox = ? AND uid = ?
            ",
        )
        .bind(mailbox)
        .bind(uid.get())
        .fetch_optional(&self.pool)
        .await?;

        row.map_or(Ok(None), |row| decode_envelope(&row))
    }

    /// List every synced mailbox with its checkpoint, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_mailboxes(&self) -> Result<Vec<MailboxSummary>> {
        let rows = sqlx::query(
            r"
            SELECT s.mailbox, s.uid_validity, s.last_synced_uid, s.updated_at,
                   (SELECT COUNT(*) FROM envelopes e WHERE e.mailbox = s.mailbox) as count
            FROM mailbox_state s
            ORDER BY s.mailbox
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut mailboxes = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(state) = decode_state(row)? {
                let count: i64 = row.try_get("count")?;
                mailboxes.push(MailboxSummary {
                    mailbox: row.try_get("mailbox")?,
                    state,
                    envelope_count: usize::try_from(count).unwrap_or(0),
                });
            }
        }
        Ok(mailboxes)
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Decode a `mailbox_state` row. Rows with a zero epoch are skipped.
fn decode_state(row: &SqliteRow) -> Result<Option<MailboxSyncState>> {
    let Some(uid_validity) = UidValidity::new(row.try_get("uid_validity")?) else {
        return Ok(None);
    };
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Some(MailboxSyncState {
        uid_validity,
        last_synced_uid: row.try_get("last_synced_uid")?,
        updated_at: parse_timestamp(&updated_at).unwrap_or_default(),
    }))
}

/// Decode an `envelopes` row. Rows with a zero UID or epoch are skipped.
fn decode_envelope(row: &SqliteRow) -> Result<Option<CachedEnvelope>> {
    let (Some(uid), Some(uid_validity)) = (
        Uid::new(row.try_get("uid")?),
        UidValidity::new(row.try_get("uid_validity")?),
    ) else {
        return Ok(None);
    };

    let from_json: String = row.try_get("from_json")?;
    let to_json: String = row.try_get("to_json")?;
    let cc_json: String = row.try_get("cc_json")?;
    let flags_json: String = row.try_get("flags_json")?;

    let from: Vec<Address> = serde_json::from_str(&from_json)?;
    let to: Vec<Address> = serde_json::from_str(&to_json)?;
    let cc: Vec<Address> = serde_json::from_str(&cc_json)?;
    let flags: Vec<String> = serde_json::from_str(&flags_json)?;
    let date: Option<String> = row.try_get("date")?;
    let cached_at: String = row.try_get("cached_at")?;

    Ok(Some(CachedEnvelope {
        mailbox: row.try_get("mailbox")?,
        uid_validity,
        envelope: Envelope {
            uid,
            message_id: row.try_get("message_id")?,
            in_reply_to: row.try_get("in_reply_to")?,
            subject: row.try_get("subject")?,
            from,
            to,
            cc,
            date: date.and_then(|d| DateTime::parse_from_rfc3339(&d).ok()),
            flags,
        },
        cached_at: parse_timestamp(&cached_at).unwrap_or_default(),
    }))
}
