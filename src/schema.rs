//! Database schema management for `fieldbus-sim-bridge`.
//!
//! Ensures required tables and indexes exist before any job starts.
//! Applied once on startup from `main.rs`. Only the reading store is touched;
//! the dashboard's schema is never altered.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create the reading store schema (idempotent).
///
/// Creates `sensor_readings` for the simulator's tick log and `sync_cursor`
/// for the bridge watermark. Safe to call on every startup.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Tick log; (sensor_key, tick_seq) makes a retried tick a no-op
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            id           BIGSERIAL PRIMARY KEY,
            tick_seq     BIGINT           NOT NULL,
            sensor_key   TEXT             NOT NULL,
            zone_id      BIGINT           NOT NULL,
            category     TEXT             NOT NULL,
            value        DOUBLE PRECISION NOT NULL,
            unit         TEXT             NOT NULL,
            recorded_at  TIMESTAMPTZ      NOT NULL,
            UNIQUE (sensor_key, tick_seq)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_recorded_at
            ON sensor_readings (recorded_at);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Bridge watermark, one row per bridge
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursor (
            name            TEXT PRIMARY KEY,
            synced_through  TIMESTAMPTZ NOT NULL,
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
