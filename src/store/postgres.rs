//! sqlx/Postgres implementations of the store traits.
//!
//! The reading store tables are created by `schema::create_schema`. The
//! destination tables belong to the dashboard; we only read its catalogue and
//! write rows into `data_data`, never its schema.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::StoreError;
use crate::models::{CatalogueEntry, DestinationRecord, Reading, SensorCategory, TickBatch};

use super::{DestinationStore, ReadingStore};

// ---

/// Cursor row name in `sync_cursor`.
const CURSOR_NAME: &str = "destination_bridge";

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("value {value} exceeds BIGINT range")))
}

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    // ---
    tick_seq: i64,
    sensor_key: String,
    zone_id: i64,
    category: String,
    value: f64,
    unit: String,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = StoreError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        // ---
        let category = SensorCategory::parse(&row.category).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "unknown category '{}' for sensor '{}'",
                row.category, row.sensor_key
            ))
        })?;
        let tick_seq = u64::try_from(row.tick_seq)
            .map_err(|_| StoreError::Corrupt(format!("negative tick_seq {}", row.tick_seq)))?;

        Ok(Reading {
            tick_seq,
            sensor_key: row.sensor_key,
            zone_id: row.zone_id,
            category,
            value: row.value,
            unit: row.unit,
            recorded_at: row.recorded_at,
        })
    }
}

/// Simulator reading log in the service's own database.
#[derive(Debug, Clone)]
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ReadingStore for PgReadingStore {
    // ---
    async fn last_tick_seq(&self) -> Result<Option<u64>, StoreError> {
        // ---
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(tick_seq) FROM sensor_readings")
            .fetch_one(&self.pool)
            .await?;

        max.map(|seq| {
            u64::try_from(seq).map_err(|_| StoreError::Corrupt(format!("negative tick_seq {seq}")))
        })
        .transpose()
    }

    async fn append(&self, batch: &TickBatch) -> Result<u64, StoreError> {
        // ---
        let tick_seq = to_i64(batch.tick_seq)?;
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for reading in &batch.readings {
            let result = sqlx::query(
                r#"
                INSERT INTO sensor_readings (
                    tick_seq, sensor_key, zone_id, category, value, unit, recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (sensor_key, tick_seq) DO NOTHING
                "#,
            )
            .bind(tick_seq)
            .bind(&reading.sensor_key)
            .bind(reading.zone_id)
            .bind(reading.category.as_str())
            .bind(reading.value)
            .bind(&reading.unit)
            .bind(reading.recorded_at)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn latest_recorded_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        // ---
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(recorded_at) FROM sensor_readings")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    async fn readings_after(
        &self,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        let limit = i64::try_from(limit)
            .map_err(|_| StoreError::Corrupt(format!("read limit {limit} exceeds BIGINT range")))?;

        // `page_end` is the timestamp of the `limit`th row; every row up to
        // and including it is returned so a tick is never split.
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            WITH page AS (
                SELECT recorded_at
                FROM sensor_readings
                WHERE $1::TIMESTAMPTZ IS NULL OR recorded_at > $1
                ORDER BY recorded_at ASC
                LIMIT $2
            )
            SELECT tick_seq, sensor_key, zone_id, category, value, unit, recorded_at
            FROM sensor_readings
            WHERE ($1::TIMESTAMPTZ IS NULL OR recorded_at > $1)
              AND recorded_at <= (SELECT MAX(recorded_at) FROM page)
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    async fn load_cursor(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        // ---
        let cursor: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT synced_through FROM sync_cursor WHERE name = $1")
            .bind(CURSOR_NAME)
            .fetch_optional(&self.pool)
            .await?;
        Ok(cursor)
    }

    async fn save_cursor(&self, through: DateTime<Utc>) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO sync_cursor (name, synced_through, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE SET
                synced_through = GREATEST(sync_cursor.synced_through, EXCLUDED.synced_through),
                updated_at     = NOW()
            "#,
        )
        .bind(CURSOR_NAME)
        .bind(through)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let result = sqlx::query("DELETE FROM sensor_readings WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CatalogueRow {
    // ---
    id: i64,
    name: String,
    zone_id: Option<i64>,
    bridge_eligible: bool,
}

/// The dashboard's database.
#[derive(Debug, Clone)]
pub struct PgDestinationStore {
    pool: PgPool,
}

impl PgDestinationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DestinationStore for PgDestinationStore {
    // ---
    async fn catalogue(&self) -> Result<Vec<CatalogueEntry>, StoreError> {
        // ---
        // The zone of a destination sensor is the object (building) its
        // system belongs to. Categories are not declared in this schema and
        // are derived from the display name.
        let rows: Vec<CatalogueRow> = sqlx::query_as(
            r#"
            SELECT a.id::BIGINT        AS id,
                   a.name::TEXT        AS name,
                   o.id::BIGINT        AS zone_id,
                   a.modbus_carel      AS bridge_eligible
            FROM data_atributes a
            LEFT JOIN data_system s ON a.sys_id = s.id
            LEFT JOIN data_obj o    ON s.obj_id = o.id
            WHERE a.modbus_carel = TRUE
            ORDER BY a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CatalogueEntry {
                id: row.id,
                name: row.name,
                zone_id: row.zone_id,
                category: None,
                bridge_eligible: row.bridge_eligible,
            })
            .collect())
    }

    async fn upsert(&self, records: &[DestinationRecord]) -> Result<u64, StoreError> {
        // ---
        // `data_data` carries no unique key on (name_id, date) and may already
        // hold duplicates, so update in place and insert only when nothing
        // matched.
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for record in records {
            let updated = sqlx::query(
                r#"
                UPDATE data_data
                SET value = $1, updated_at = NOW()
                WHERE name_id = $2 AND date = $3
                "#,
            )
            .bind(record.value)
            .bind(record.destination_id)
            .bind(record.recorded_at)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                sqlx::query(
                    r#"
                    INSERT INTO data_data (created_at, updated_at, value, date, name_id)
                    VALUES (NOW(), NOW(), $1, $2, $3)
                    "#,
                )
                .bind(record.value)
                .bind(record.recorded_at)
                .bind(record.destination_id)
                .execute(&mut *tx)
                .await?;
            }

            written += 1;
        }

        tx.commit().await?;
        Ok(written)
    }
}
