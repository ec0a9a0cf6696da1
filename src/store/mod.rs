//! Storage seams for the simulator and the bridge.
//!
//! The reading store (owned by this service) and the destination store (owned
//! by the dashboard) are traits so the tick and the sync cycle can be driven
//! against the in-memory implementation in tests. Production uses the sqlx
//! Postgres implementations in [`postgres`].
//!
//! Every call made by a background task goes through [`timed`]; a store that
//! stops answering aborts the tick or cycle instead of stalling it.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{CatalogueEntry, DestinationRecord, Reading, TickBatch};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::{PgDestinationStore, PgReadingStore};

// ---

/// Append-only log of simulator readings plus the bridge's persisted cursor.
pub trait ReadingStore: Send + Sync + 'static {
    // ---
    /// Highest tick sequence number stored so far.
    fn last_tick_seq(&self) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    /// Persist a tick atomically. Rows already present for the same
    /// `(sensor_key, tick_seq)` are left alone; returns the rows inserted.
    fn append(&self, batch: &TickBatch) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Timestamp of the newest stored reading.
    fn latest_recorded_at(
        &self,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, StoreError>> + Send;

    /// One page of readings strictly newer than `after` (from the start when
    /// `None`), ordered by timestamp then insertion. A page holds the first
    /// `limit` readings plus any others sharing the last one's timestamp, so
    /// a tick is never split across pages.
    fn readings_after(
        &self,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Reading>, StoreError>> + Send;

    fn load_cursor(&self) -> impl Future<Output = Result<Option<DateTime<Utc>>, StoreError>> + Send;

    /// Record that everything up to and including `through` is synced. The
    /// stored value never moves backwards.
    fn save_cursor(
        &self,
        through: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete readings older than `cutoff`; returns the rows removed.
    fn prune_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// The dashboard's store: a sensor catalogue we read and a readings table we
/// upsert into.
pub trait DestinationStore: Send + Sync + 'static {
    // ---
    /// Bridge-eligible catalogue entries.
    fn catalogue(&self) -> impl Future<Output = Result<Vec<CatalogueEntry>, StoreError>> + Send;

    /// Write `records` in one transaction. A record replaces the value of
    /// every existing row with the same (destination id, timestamp) and is
    /// inserted only when there is none; returns the records written.
    fn upsert(
        &self,
        records: &[DestinationRecord],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Bound a store call by `limit`.
pub async fn timed<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    // ---
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, after: limit }),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timed_times_out() {
        // ---
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, StoreError>(1)
        };
        let err = timed("slow op", Duration::from_secs(5), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { op: "slow op", .. }));
    }

    #[tokio::test]
    async fn test_timed_passes_through() {
        // ---
        let value = timed("fast op", Duration::from_secs(5), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
