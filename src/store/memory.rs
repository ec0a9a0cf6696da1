//! In-memory stores with failure and latency injection, for driving ticks
//! and sync cycles deterministically in tests.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{CatalogueEntry, DestinationRecord, Reading, TickBatch};

use super::{DestinationStore, ReadingStore};

// ---

fn transient() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

/// Consume one pending injected failure, if any.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Sleep for an injected delay, if one is set. Use with paused time.
async fn lag(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default)]
struct ReadingLog {
    rows: Vec<Reading>,
    cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryReadingStore {
    // ---
    log: Mutex<ReadingLog>,
    fail_appends: AtomicU32,
    fail_appends_after_commit: AtomicU32,
    fail_reads: AtomicU32,
    fail_cursor_saves: AtomicU32,
    append_delay_ms: AtomicU64,
    read_delay_ms: AtomicU64,
    reads: AtomicUsize,
}

impl MemoryReadingStore {
    // ---
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// The append lands but the caller is told it failed.
    pub fn fail_next_appends_after_commit(&self, n: u32) {
        self.fail_appends_after_commit.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_cursor_saves(&self, n: u32) {
        self.fail_cursor_saves.store(n, Ordering::SeqCst);
    }

    pub fn delay_appends(&self, delay: Duration) {
        self.append_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    pub fn delay_reads(&self, delay: Duration) {
        self.read_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Pages served by `readings_after`.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap().rows.len()
    }

    pub fn rows(&self) -> Vec<Reading> {
        self.log.lock().unwrap().rows.clone()
    }

    /// Append readings directly, bypassing the engine.
    pub fn seed(&self, readings: impl IntoIterator<Item = Reading>) {
        self.log.lock().unwrap().rows.extend(readings);
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.log.lock().unwrap().cursor
    }
}

impl ReadingStore for MemoryReadingStore {
    // ---
    async fn last_tick_seq(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.log.lock().unwrap().rows.iter().map(|r| r.tick_seq).max())
    }

    async fn latest_recorded_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.log.lock().unwrap().rows.iter().map(|r| r.recorded_at).max())
    }

    async fn append(&self, batch: &TickBatch) -> Result<u64, StoreError> {
        // ---
        lag(&self.append_delay_ms).await;
        if take(&self.fail_appends) {
            return Err(transient());
        }

        let mut log = self.log.lock().unwrap();
        let mut inserted = 0;
        for reading in &batch.readings {
            let exists = log
                .rows
                .iter()
                .any(|r| r.sensor_key == reading.sensor_key && r.tick_seq == batch.tick_seq);
            if !exists {
                log.rows.push(reading.clone());
                inserted += 1;
            }
        }
        drop(log);

        if take(&self.fail_appends_after_commit) {
            return Err(transient());
        }
        Ok(inserted)
    }

    async fn readings_after(
        &self,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        lag(&self.read_delay_ms).await;
        if take(&self.fail_reads) {
            return Err(transient());
        }
        self.reads.fetch_add(1, Ordering::SeqCst);

        let log = self.log.lock().unwrap();
        let mut rows: Vec<Reading> = log
            .rows
            .iter()
            .filter(|r| after.map_or(true, |cursor| r.recorded_at > cursor))
            .cloned()
            .collect();
        // Stable sort keeps insertion order within a timestamp, like `id ASC`.
        rows.sort_by_key(|r| r.recorded_at);

        if let Some(page_end) = rows.get(limit.max(1) - 1).map(|r| r.recorded_at) {
            rows.retain(|r| r.recorded_at <= page_end);
        }
        Ok(rows)
    }

    async fn load_cursor(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.log.lock().unwrap().cursor)
    }

    async fn save_cursor(&self, through: DateTime<Utc>) -> Result<(), StoreError> {
        // ---
        if take(&self.fail_cursor_saves) {
            return Err(transient());
        }
        let mut log = self.log.lock().unwrap();
        log.cursor = Some(log.cursor.map_or(through, |current| current.max(through)));
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let mut log = self.log.lock().unwrap();
        let before = log.rows.len();
        log.rows.retain(|r| r.recorded_at >= cutoff);
        Ok((before - log.rows.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryDestination {
    // ---
    catalogue: Mutex<Vec<CatalogueEntry>>,
    /// No uniqueness, like the dashboard's table.
    rows: Mutex<Vec<DestinationRecord>>,
    fail_upserts: AtomicU32,
    fail_catalogue: AtomicU32,
    upsert_calls: AtomicUsize,
    /// Absolute call number (1-based) that fails; 0 disables.
    fail_on_call: AtomicUsize,
    upsert_delay_ms: AtomicU64,
}

impl MemoryDestination {
    // ---
    pub fn with_catalogue(entries: Vec<CatalogueEntry>) -> Self {
        let store = Self::default();
        store.set_catalogue(entries);
        store
    }

    pub fn set_catalogue(&self, entries: Vec<CatalogueEntry>) {
        *self.catalogue.lock().unwrap() = entries;
    }

    pub fn fail_next_upserts(&self, n: u32) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }

    /// Fail the `n`th upsert from now (1-based); earlier calls succeed.
    pub fn fail_on_upsert_call(&self, n: usize) {
        let target = self.upsert_calls.load(Ordering::SeqCst) + n;
        self.fail_on_call.store(target, Ordering::SeqCst);
    }

    pub fn fail_next_catalogue_reads(&self, n: u32) {
        self.fail_catalogue.store(n, Ordering::SeqCst);
    }

    pub fn delay_upserts(&self, delay: Duration) {
        self.upsert_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Rows written by something else, duplicates included.
    pub fn seed_rows(&self, records: impl IntoIterator<Item = DestinationRecord>) {
        self.rows.lock().unwrap().extend(records);
    }

    /// Every row, ordered by (destination id, timestamp).
    pub fn records(&self) -> Vec<DestinationRecord> {
        let mut rows = self.rows.lock().unwrap().clone();
        rows.sort_by(|a, b| {
            (a.destination_id, a.recorded_at).cmp(&(b.destination_id, b.recorded_at))
        });
        rows
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

impl DestinationStore for MemoryDestination {
    // ---
    async fn catalogue(&self) -> Result<Vec<CatalogueEntry>, StoreError> {
        // ---
        if take(&self.fail_catalogue) {
            return Err(transient());
        }
        Ok(self
            .catalogue
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.bridge_eligible)
            .cloned()
            .collect())
    }

    async fn upsert(&self, records: &[DestinationRecord]) -> Result<u64, StoreError> {
        // ---
        lag(&self.upsert_delay_ms).await;
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if take(&self.fail_upserts) || self.fail_on_call.load(Ordering::SeqCst) == call {
            return Err(transient());
        }

        // All-or-nothing, like the transaction it stands in for.
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            let mut matched = false;
            for row in rows.iter_mut().filter(|row| {
                row.destination_id == record.destination_id && row.recorded_at == record.recorded_at
            }) {
                row.value = record.value;
                matched = true;
            }
            if !matched {
                rows.push(record.clone());
            }
        }
        Ok(records.len() as u64)
    }
}
