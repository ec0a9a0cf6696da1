//! Pruning of the reading log.
//!
//! Readings are kept for a fixed window and never deleted before the bridge
//! has moved past them: the cutoff is the older of `now - retention` and the
//! sync cursor. Until the bridge has a cursor nothing is pruned.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::bridge::SyncStatusHandle;
use crate::error::StoreError;
use crate::scheduler::Job;
use crate::store::{self, ReadingStore};

// ---

pub struct RetentionJob<R> {
    // ---
    readings: Arc<R>,
    status: SyncStatusHandle,
    retention: chrono::Duration,
    timeout: Duration,
}

impl<R: ReadingStore> RetentionJob<R> {
    // ---
    pub fn new(
        readings: Arc<R>,
        status: SyncStatusHandle,
        retention: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            readings,
            status,
            retention,
            timeout,
        }
    }

    /// Delete readings that are both past retention and already synced.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let Some(cursor) = self.status.cursor() else {
            tracing::debug!("no sync cursor yet, skipping retention");
            return Ok(0);
        };

        let Some(oldest_kept) = now.checked_sub_signed(self.retention) else {
            tracing::warn!(retention = %self.retention, "retention window reaches past the earliest timestamp, skipping");
            return Ok(0);
        };
        let cutoff = oldest_kept.min(cursor);
        let deleted = store::timed(
            "prune old readings",
            self.timeout,
            self.readings.prune_before(cutoff),
        )
        .await?;

        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "pruned old readings");
        }
        Ok(deleted)
    }
}

impl<R: ReadingStore> Job for RetentionJob<R> {
    fn name(&self) -> &'static str {
        "retention"
    }

    async fn run_once(&mut self) -> Result<()> {
        self.prune(Utc::now()).await?;
        Ok(())
    }
}
