//! SQLite-backed [`EventQueue`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{schema, EventQueue};
use crate::error::{Error, Result};
use crate::types::{format_timestamp, parse_timestamp, EventRecord, NewRecord, RecordId};

/// Durable event queue.
///
/// A store whose database failed to open stays usable in degraded form:
/// `enqueue` reports [`Error::StoreUnavailable`], reads come back empty and
/// removals are no-ops.
pub struct QueueStore {
    conn: Option<Mutex<Connection>>,
}

impl QueueStore {
    /// Open or create the queue at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Some(Mutex::new(conn)),
        })
    }

    /// Open the queue, degrading to best-effort delivery if that fails.
    pub fn open_or_degrade(path: &Path) -> Self {
        match Self::open(path) {
            Ok(store) => {
                tracing::info!(path = %path.display(), "Opened event queue");
                store
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Event queue unavailable, failed events will be dropped"
                );
                Self::unavailable()
            }
        }
    }

    /// Open an in-memory queue (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Some(Mutex::new(conn)),
        })
    }

    /// A store with no backing database
    pub fn unavailable() -> Self {
        Self { conn: None }
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    /// Acquire the connection lock, `None` when degraded.
    fn lock_conn(&self) -> Result<Option<MutexGuard<'_, Connection>>> {
        match &self.conn {
            Some(conn) => conn
                .lock()
                .map(Some)
                .map_err(|_| Error::StoreUnavailable("queue lock poisoned".to_string())),
            None => Ok(None),
        }
    }

    fn insert(&self, record: &NewRecord) -> Result<RecordId> {
        let conn = self
            .lock_conn()?
            .ok_or_else(|| Error::StoreUnavailable("queue was never opened".to_string()))?;

        let payload = serde_json::to_string(&record.payload)?;
        conn.execute(
            r#"
            INSERT INTO failed_events (payload, timestamp, source, resent, enqueued_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            "#,
            params![
                payload,
                record.timestamp,
                record.source,
                format_timestamp(Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn select_all(&self) -> Result<Vec<EventRecord>> {
        let Some(conn) = self.lock_conn()? else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT id, payload, timestamp, source, resent FROM failed_events ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawRecord::into_record).collect()
    }

    fn delete(&self, id: RecordId) -> Result<()> {
        if let Some(conn) = self.lock_conn()? {
            conn.execute("DELETE FROM failed_events WHERE id = ?1", [id])?;
        }
        Ok(())
    }

    fn stamp(&self, id: RecordId, source: &str) -> Result<()> {
        if let Some(conn) = self.lock_conn()? {
            conn.execute(
                "UPDATE failed_events SET source = COALESCE(source, ?2), resent = 1 WHERE id = ?1",
                params![id, source],
            )?;
        }
        Ok(())
    }

    fn sweep(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(mut conn) = self.lock_conn()? else {
            return Ok(0);
        };

        let tx = conn.transaction()?;
        let expired: Vec<(RecordId, String)> = {
            let mut stmt = tx.prepare("SELECT id, timestamp FROM failed_events ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            // Unparsable timestamps are kept rather than guessed at
            rows.into_iter()
                .filter(|(_, ts)| parse_timestamp(ts).is_some_and(|created| created < cutoff))
                .collect()
        };

        for (id, timestamp) in &expired {
            tx.execute("DELETE FROM failed_events WHERE id = ?1", [id])?;
            tracing::debug!(id, timestamp = %timestamp, "Deleted aged-out event");
        }
        tx.commit()?;

        Ok(expired.len())
    }

    fn count(&self) -> Result<usize> {
        let Some(conn) = self.lock_conn()? else {
            return Ok(0);
        };
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM failed_events", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl EventQueue for QueueStore {
    async fn enqueue(&self, record: NewRecord) -> Result<RecordId> {
        self.insert(&record)
    }

    async fn list_all(&self) -> Result<Vec<EventRecord>> {
        self.select_all()
    }

    async fn remove(&self, id: RecordId) -> Result<()> {
        self.delete(id)
    }

    async fn stamp_resent(&self, id: RecordId, source: &str) -> Result<()> {
        self.stamp(id, source)
    }

    async fn age_sweep(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.sweep(cutoff)
    }

    async fn len(&self) -> Result<usize> {
        self.count()
    }
}

/// Row as stored, before the payload JSON is decoded.
struct RawRecord {
    id: RecordId,
    payload: String,
    timestamp: String,
    source: Option<String>,
    resent: bool,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            timestamp: row.get(2)?,
            source: row.get(3)?,
            resent: row.get::<_, i64>(4)? != 0,
        })
    }

    fn into_record(self) -> Result<EventRecord> {
        Ok(EventRecord {
            id: self.id,
            payload: serde_json::from_str(&self.payload)?,
            timestamp: self.timestamp,
            source: self.source,
            resent: self.resent,
        })
    }
}
