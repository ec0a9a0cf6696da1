//! Sync bridge: moves simulator readings into the dashboard's store.
//!
//! Each cycle works through the readings newer than the watermark cursor in
//! bounded pages. A page is resolved to destination sensors, written, and only
//! then is the cursor advanced to the page's last timestamp. Pages never split
//! a timestamp, so the cursor always sits on a tick boundary. A store failure
//! aborts the cycle with the cursor left at the last completed page, and the
//! next cycle replays from there; writes keyed by (destination id, timestamp)
//! make that replay duplicate-free.
//!
//! Readings with no destination sensor are counted as unmapped and skipped
//! for good; they never hold the cursor back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::mapping::{MappingResolver, MappingTable};
use crate::models::{DestinationId, DestinationRecord, SensorCategory, ZoneId};
use crate::scheduler::Job;
use crate::store::{self, DestinationStore, ReadingStore};

// ---

/// Counts reported at the end of every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    // ---
    pub cycle_id: Uuid,
    /// Pages read this cycle, the final empty or short one included.
    pub pages: usize,
    pub read: usize,
    pub mapped: usize,
    pub written: u64,
    pub unmapped: usize,
    /// Mapped readings folded into another record with the same
    /// (destination id, timestamp).
    pub duplicates: usize,
    pub errors: usize,
    pub cursor: Option<DateTime<Utc>>,
    /// When the mapping table used for this cycle was built.
    pub mapping_built_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

/// Counts for one page of readings.
#[derive(Debug, Default)]
struct PageCounts {
    read: usize,
    mapped: usize,
    written: u64,
    unmapped: usize,
    duplicates: usize,
}

/// Bridge progress visible to the administrative API and the retention job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    // ---
    pub cursor: Option<DateTime<Utc>>,
    pub last_summary: Option<CycleSummary>,
    pub last_error: Option<String>,
    pub cycles: u64,
    pub failures: u64,
}

/// Shared handle over [`SyncStatus`]. Only the bridge moves the cursor.
#[derive(Debug, Clone, Default)]
pub struct SyncStatusHandle {
    inner: Arc<RwLock<SyncStatus>>,
}

impl SyncStatusHandle {
    // ---
    pub fn new(cursor: Option<DateTime<Utc>>) -> Self {
        SyncStatusHandle {
            inner: Arc::new(RwLock::new(SyncStatus {
                cursor,
                ..SyncStatus::default()
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SyncStatus> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, SyncStatus> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self) -> SyncStatus {
        self.read().clone()
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.read().cursor
    }

    /// Never moves the cursor backwards.
    fn advance_cursor(&self, through: DateTime<Utc>) {
        let mut status = self.write();
        if status.cursor.map_or(true, |current| through > current) {
            status.cursor = Some(through);
        }
    }

    fn record_success(&self, summary: CycleSummary) {
        let mut status = self.write();
        status.cycles += 1;
        status.last_error = None;
        status.last_summary = Some(summary);
    }

    fn record_failure(&self, err: &StoreError) {
        let mut status = self.write();
        status.cycles += 1;
        status.failures += 1;
        status.last_error = Some(err.to_string());
    }
}

/// Tunables for [`SyncBridge`].
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    // ---
    /// Maximum records per destination transaction.
    pub chunk_size: usize,
    /// Readings per page read from the reading store.
    pub read_limit: usize,
    pub store_timeout: Duration,
}

pub struct SyncBridge<R, D> {
    // ---
    readings: Arc<R>,
    destination: Arc<D>,
    resolver: MappingResolver,
    status: SyncStatusHandle,
    settings: BridgeSettings,
}

impl<R: ReadingStore, D: DestinationStore> SyncBridge<R, D> {
    // ---
    pub fn new(
        readings: Arc<R>,
        destination: Arc<D>,
        resolver: MappingResolver,
        status: SyncStatusHandle,
        settings: BridgeSettings,
    ) -> Self {
        SyncBridge {
            readings,
            destination,
            resolver,
            status,
            settings,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> &SyncStatusHandle {
        &self.status
    }

    /// Run one sync cycle and publish its summary.
    pub async fn run_cycle(&self) -> Result<CycleSummary, StoreError> {
        // ---
        let cycle_id = Uuid::new_v4();

        match self.sync(cycle_id).await {
            Ok(summary) => {
                tracing::info!(
                    cycle_id = %summary.cycle_id,
                    pages = summary.pages,
                    read = summary.read,
                    mapped = summary.mapped,
                    written = summary.written,
                    unmapped = summary.unmapped,
                    duplicates = summary.duplicates,
                    errors = summary.errors,
                    cursor = ?summary.cursor,
                    "sync cycle complete"
                );
                self.status.record_success(summary.clone());
                Ok(summary)
            }
            Err(err) => {
                tracing::warn!(
                    cycle_id = %cycle_id,
                    errors = 1,
                    cursor = ?self.status.cursor(),
                    "sync cycle aborted, cursor held at last completed page: {}",
                    err
                );
                self.status.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn sync(&self, cycle_id: Uuid) -> Result<CycleSummary, StoreError> {
        // ---
        // One mapping snapshot for the whole cycle
        let table = self.resolver.snapshot();
        let read_limit = self.settings.read_limit.max(1);
        let mut total = PageCounts::default();
        let mut pages = 0;

        loop {
            let cursor = self.status.cursor();
            let (page, high_water) = self.sync_page(cycle_id, &table, cursor).await?;
            pages += 1;

            total.read += page.read;
            total.mapped += page.mapped;
            total.written += page.written;
            total.unmapped += page.unmapped;
            total.duplicates += page.duplicates;

            // A short page means the backlog is drained.
            if high_water.is_none() || page.read < read_limit {
                break;
            }
        }

        if total.read == 0 {
            tracing::debug!(cycle_id = %cycle_id, cursor = ?self.status.cursor(), "no new readings");
        }

        Ok(CycleSummary {
            cycle_id,
            pages,
            read: total.read,
            mapped: total.mapped,
            written: total.written,
            unmapped: total.unmapped,
            duplicates: total.duplicates,
            errors: 0,
            cursor: self.status.cursor(),
            mapping_built_at: table.built_at(),
            finished_at: Utc::now(),
        })
    }

    /// Sync one page past `cursor`; returns its counts and the timestamp the
    /// cursor was advanced to, `None` when there was nothing to read.
    async fn sync_page(
        &self,
        cycle_id: Uuid,
        table: &MappingTable,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<(PageCounts, Option<DateTime<Utc>>), StoreError> {
        // ---
        let timeout = self.settings.store_timeout;

        // Step 1: the next page past the watermark, oldest first
        let readings = store::timed(
            "fetch unsynced readings",
            timeout,
            self.readings.readings_after(cursor, self.settings.read_limit.max(1)),
        )
        .await?;

        let Some(high_water) = readings.iter().map(|r| r.recorded_at).max() else {
            return Ok((PageCounts::default(), None));
        };

        // Step 2: resolve, last write wins
        let mut pending: BTreeMap<(DestinationId, DateTime<Utc>), f64> = BTreeMap::new();
        let mut gaps: BTreeSet<(ZoneId, SensorCategory)> = BTreeSet::new();
        let mut mapped = 0;
        let mut unmapped = 0;

        for reading in &readings {
            match table.resolve(reading.zone_id, reading.category) {
                Some(destination_id) => {
                    mapped += 1;
                    pending.insert((destination_id, reading.recorded_at), reading.value);
                }
                None => {
                    unmapped += 1;
                    gaps.insert((reading.zone_id, reading.category));
                }
            }
        }

        for (zone, category) in &gaps {
            tracing::debug!(cycle_id = %cycle_id, zone, category = %category, "no destination sensor");
        }

        let records: Vec<DestinationRecord> = pending
            .into_iter()
            .map(|((destination_id, recorded_at), value)| DestinationRecord {
                destination_id,
                value,
                recorded_at,
            })
            .collect();
        let duplicates = mapped - records.len();

        // Step 3: chunked transactional writes
        let mut written = 0;
        for chunk in records.chunks(self.settings.chunk_size.max(1)) {
            written += store::timed(
                "upsert destination records",
                timeout,
                self.destination.upsert(chunk),
            )
            .await?;
        }

        // Step 4: persist, then publish, the new watermark
        store::timed(
            "save sync cursor",
            timeout,
            self.readings.save_cursor(high_water),
        )
        .await?;
        self.status.advance_cursor(high_water);

        tracing::debug!(
            cycle_id = %cycle_id,
            read = readings.len(),
            written,
            cursor = %high_water,
            "page synced"
        );

        let counts = PageCounts {
            read: readings.len(),
            mapped,
            written,
            unmapped,
            duplicates,
        };
        Ok((counts, Some(high_water)))
    }
}

/// Periodic job wrapping [`SyncBridge::run_cycle`].
pub struct BridgeJob<R, D> {
    bridge: SyncBridge<R, D>,
}

impl<R: ReadingStore, D: DestinationStore> BridgeJob<R, D> {
    pub fn new(bridge: SyncBridge<R, D>) -> Self {
        Self { bridge }
    }
}

impl<R: ReadingStore, D: DestinationStore> Job for BridgeJob<R, D> {
    fn name(&self) -> &'static str {
        "sync-bridge"
    }

    async fn run_once(&mut self) -> Result<()> {
        self.bridge.run_cycle().await?;
        Ok(())
    }
}
