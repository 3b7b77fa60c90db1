//! Durable queue of events awaiting resend
//!
//! Records live in a single SQLite table, `failed_events`, keyed by an
//! autoincrement id. The queue is append-only from the pipeline's point of
//! view: records are inserted, stamped once, and removed.

pub mod schema;
mod store;

pub use store::QueueStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{EventRecord, NewRecord, RecordId};

/// Storage seam for the delivery pipeline.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append a record, returning its freshly assigned id.
    async fn enqueue(&self, record: NewRecord) -> Result<RecordId>;

    /// All pending records, oldest first.
    async fn list_all(&self) -> Result<Vec<EventRecord>>;

    /// Delete by id. Absent ids are not an error.
    async fn remove(&self, id: RecordId) -> Result<()>;

    /// Set `source` if it is still unset, and mark the record as resent.
    async fn stamp_resent(&self, id: RecordId, source: &str) -> Result<()>;

    /// Drop records created before `cutoff`. Returns how many were removed.
    async fn age_sweep(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Number of pending records.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
