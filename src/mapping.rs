//! Resolves simulator (zone, category) pairs to destination sensors.
//!
//! The lookup is built from the destination catalogue on its own refresh
//! period and swapped in whole, so a sync cycle always works against one
//! immutable [`MappingTable`] even if a refresh lands mid-cycle.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{CatalogueEntry, DestinationId, SensorCategory, ZoneId};
use crate::scheduler::Job;
use crate::store::{self, DestinationStore};

// ---

/// What to do when a zone has no destination sensor of the wanted category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingFallback {
    // ---
    /// Report the reading as unmapped.
    None,
    /// Spread zones over the category's sensors by `zone % len`.
    RoundRobin,
}

impl FromStr for MappingFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            other => Err(format!("expected 'none' or 'round_robin', got '{}'", other)),
        }
    }
}

/// Immutable lookup built from one catalogue read.
#[derive(Debug)]
pub struct MappingTable {
    // ---
    direct: HashMap<(ZoneId, SensorCategory), DestinationId>,
    by_category: HashMap<SensorCategory, Vec<DestinationId>>,
    fallback: MappingFallback,
    built_at: Option<DateTime<Utc>>,
}

impl MappingTable {
    // ---
    pub fn empty(fallback: MappingFallback) -> Self {
        MappingTable {
            direct: HashMap::new(),
            by_category: HashMap::new(),
            fallback,
            built_at: None,
        }
    }

    /// Partition bridge-eligible entries by category. Within a zone the
    /// lowest destination id wins.
    pub fn build(entries: &[CatalogueEntry], fallback: MappingFallback, now: DateTime<Utc>) -> Self {
        // ---
        let mut eligible: Vec<(&CatalogueEntry, SensorCategory)> = entries
            .iter()
            .filter(|e| e.bridge_eligible)
            .filter_map(|e| e.effective_category().map(|c| (e, c)))
            .collect();
        eligible.sort_by_key(|(e, _)| e.id);

        let mut table = MappingTable {
            built_at: Some(now),
            ..Self::empty(fallback)
        };
        for (entry, category) in eligible {
            table.by_category.entry(category).or_default().push(entry.id);
            if let Some(zone) = entry.zone_id {
                table.direct.entry((zone, category)).or_insert(entry.id);
            }
        }
        table
    }

    pub fn resolve(&self, zone: ZoneId, category: SensorCategory) -> Option<DestinationId> {
        // ---
        if let Some(id) = self.direct.get(&(zone, category)) {
            return Some(*id);
        }
        match self.fallback {
            MappingFallback::None => None,
            MappingFallback::RoundRobin => {
                let candidates = self.by_category.get(&category)?;
                if candidates.is_empty() {
                    return None;
                }
                let idx = zone.rem_euclid(candidates.len() as i64) as usize;
                Some(candidates[idx])
            }
        }
    }

    /// Number of eligible destination sensors per category.
    pub fn category_counts(&self) -> Vec<(SensorCategory, usize)> {
        SensorCategory::ALL
            .into_iter()
            .map(|c| (c, self.by_category.get(&c).map_or(0, Vec::len)))
            .collect()
    }

    pub fn direct_mappings(&self) -> usize {
        self.direct.len()
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }
}

/// Shared handle over the current [`MappingTable`].
#[derive(Debug, Clone)]
pub struct MappingResolver {
    current: Arc<RwLock<Arc<MappingTable>>>,
    fallback: MappingFallback,
}

impl MappingResolver {
    // ---
    pub fn new(fallback: MappingFallback) -> Self {
        MappingResolver {
            current: Arc::new(RwLock::new(Arc::new(MappingTable::empty(fallback)))),
            fallback,
        }
    }

    /// The table to use for a whole sync cycle.
    pub fn snapshot(&self) -> Arc<MappingTable> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    #[cfg(test)]
    pub fn resolve(&self, zone: ZoneId, category: SensorCategory) -> Option<DestinationId> {
        self.snapshot().resolve(zone, category)
    }

    fn install(&self, table: MappingTable) {
        let table = Arc::new(table);
        match self.current.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }

    /// Rebuild from the destination catalogue. On failure the previous table
    /// stays in place.
    pub async fn refresh<D: DestinationStore>(
        &self,
        destination: &D,
        timeout: Duration,
    ) -> Result<usize, StoreError> {
        // ---
        let entries = store::timed("read destination catalogue", timeout, destination.catalogue())
            .await?;
        let table = MappingTable::build(&entries, self.fallback, Utc::now());

        if entries.is_empty() {
            tracing::warn!("No bridge-eligible sensors in destination catalogue; nothing will sync");
        }
        for (category, count) in table.category_counts() {
            tracing::debug!("  {:<12}: {} destination sensors", category.as_str(), count);
        }
        let direct = table.direct_mappings();
        tracing::info!(
            catalogue = entries.len(),
            direct_mappings = direct,
            "sensor mapping rebuilt"
        );

        self.install(table);
        Ok(direct)
    }
}

/// Periodic job wrapping [`MappingResolver::refresh`].
pub struct MappingRefreshJob<D> {
    // ---
    resolver: MappingResolver,
    destination: Arc<D>,
    timeout: Duration,
}

impl<D: DestinationStore> MappingRefreshJob<D> {
    pub fn new(resolver: MappingResolver, destination: Arc<D>, timeout: Duration) -> Self {
        Self {
            resolver,
            destination,
            timeout,
        }
    }
}

impl<D: DestinationStore> Job for MappingRefreshJob<D> {
    fn name(&self) -> &'static str {
        "mapping-refresh"
    }

    async fn run_once(&mut self) -> Result<()> {
        self.resolver
            .refresh(self.destination.as_ref(), self.timeout)
            .await?;
        Ok(())
    }
}
