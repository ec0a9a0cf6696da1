//! Configuration loader for the `fieldbus-sim-bridge` service.
//!
//! All runtime settings come from environment variables (with optional `.env`
//! support provided by the caller) and are validated once at startup. Nothing
//! else in the crate reads the environment.
//!
use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::bridge::BridgeSettings;
use crate::mapping::MappingFallback;
use crate::models::{default_fleet, SensorSpec};
use crate::sensor::{BoundsPolicy, ManualPolicy};

/// Longest accepted backfill or retention window (ten years).
const MAX_WINDOW_MINS: i64 = 10 * 365 * 24 * 60;

/// Parse an optional environment variable into `$ty`, with a default value.
macro_rules! parse_env {
    ($get:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $get($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($get:expr, $var_name:expr) => {
        $get($var_name).ok_or_else(|| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Reading store (this service's own database).
    pub db_url: String,

    /// Dashboard database the bridge writes into.
    pub destination_db_url: String,

    /// Maximum number of connections per pool.
    pub db_pool_max: u32,

    pub bind_addr: SocketAddr,

    pub tick_interval: Duration,
    pub sync_interval: Duration,
    pub mapping_refresh: Duration,
    pub retention_interval: Duration,

    /// Upper bound on any single store call made by a background job.
    pub store_timeout: Duration,

    /// Maximum records per destination transaction.
    pub sync_chunk_size: usize,

    /// Readings fetched per page by the bridge.
    pub sync_read_limit: usize,

    /// How far back the bridge starts when no cursor has been persisted.
    pub sync_backfill: chrono::Duration,

    pub reading_retention: chrono::Duration,

    pub manual: ManualPolicy,

    pub mapping_fallback: MappingFallback,

    /// JSON fleet definition; the built-in fleet is used when unset.
    pub sensors_file: Option<PathBuf>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – reading store connection string
///
/// Optional:
/// - `DESTINATION_DATABASE_URL` – dashboard database (default: `DATABASE_URL`)
/// - `DB_POOL_MAX` – max DB connections per pool (default: 5)
/// - `BIND_ADDR` – admin API listen address (default: 0.0.0.0:8080)
/// - `TICK_INTERVAL_MS` (default: 1000)
/// - `SYNC_INTERVAL_SECS` (default: 30)
/// - `MAPPING_REFRESH_SECS` (default: 300)
/// - `STORE_TIMEOUT_SECS` (default: 10)
/// - `SYNC_CHUNK_SIZE` (default: 500)
/// - `SYNC_READ_LIMIT` – readings per bridge read (default: 5000)
/// - `SYNC_BACKFILL_MINS` (default: 5)
/// - `RETENTION_INTERVAL_SECS` (default: 100)
/// - `READING_RETENTION_MINS` (default: 60)
/// - `RESET_OVERRIDES_ON_NORMAL` (default: true)
/// - `MANUAL_BOUNDS_POLICY` – `clamp` or `reject` (default: clamp)
/// - `MANUAL_SAFETY_MARGIN` (default: 2.0)
/// - `MAPPING_FALLBACK` – `none` or `round_robin` (default: none)
/// - `SENSORS_FILE` – JSON fleet definition
///
/// Returns an error if any required variable is missing or any value is invalid.
pub fn load_from_env() -> Result<Config> {
    load_from(|name| env::var(name).ok())
}

/// Same as [`load_from_env`] with an arbitrary variable lookup.
pub fn load_from(get: impl Fn(&str) -> Option<String>) -> Result<Config> {
    // ---
    let db_url: String = require_env!(get, "DATABASE_URL");
    let destination_db_url = get("DESTINATION_DATABASE_URL").unwrap_or_else(|| db_url.clone());
    let db_pool_max = parse_env!(get, "DB_POOL_MAX", u32, 5);
    let bind_addr = parse_env!(
        get,
        "BIND_ADDR",
        SocketAddr,
        SocketAddr::from(([0, 0, 0, 0], 8080))
    );

    let tick_ms = parse_env!(get, "TICK_INTERVAL_MS", u64, 1000);
    let sync_secs = parse_env!(get, "SYNC_INTERVAL_SECS", u64, 30);
    let mapping_secs = parse_env!(get, "MAPPING_REFRESH_SECS", u64, 300);
    let timeout_secs = parse_env!(get, "STORE_TIMEOUT_SECS", u64, 10);
    let retention_secs = parse_env!(get, "RETENTION_INTERVAL_SECS", u64, 100);
    let sync_chunk_size = parse_env!(get, "SYNC_CHUNK_SIZE", usize, 500);
    let sync_read_limit = parse_env!(get, "SYNC_READ_LIMIT", usize, 5000);
    let backfill_mins = parse_env!(get, "SYNC_BACKFILL_MINS", i64, 5);
    let retention_mins = parse_env!(get, "READING_RETENTION_MINS", i64, 60);

    let manual = ManualPolicy {
        bounds: parse_env!(get, "MANUAL_BOUNDS_POLICY", BoundsPolicy, BoundsPolicy::Clamp),
        safety_margin: parse_env!(get, "MANUAL_SAFETY_MARGIN", f64, 2.0),
        reset_on_normal: parse_env!(get, "RESET_OVERRIDES_ON_NORMAL", bool, true),
    };
    let mapping_fallback = parse_env!(
        get,
        "MAPPING_FALLBACK",
        MappingFallback,
        MappingFallback::None
    );
    let sensors_file = get("SENSORS_FILE")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from);

    for (name, value) in [
        ("TICK_INTERVAL_MS", tick_ms),
        ("SYNC_INTERVAL_SECS", sync_secs),
        ("MAPPING_REFRESH_SECS", mapping_secs),
        ("STORE_TIMEOUT_SECS", timeout_secs),
        ("RETENTION_INTERVAL_SECS", retention_secs),
    ] {
        if value == 0 {
            bail!("{} must be greater than zero", name);
        }
    }
    if sync_chunk_size == 0 {
        bail!("SYNC_CHUNK_SIZE must be greater than zero");
    }
    if sync_read_limit == 0 || i64::try_from(sync_read_limit).is_err() {
        bail!("SYNC_READ_LIMIT must be between 1 and {}", i64::MAX);
    }
    if db_pool_max == 0 {
        bail!("DB_POOL_MAX must be greater than zero");
    }
    let sync_backfill = window("SYNC_BACKFILL_MINS", backfill_mins)?;
    let reading_retention = window("READING_RETENTION_MINS", retention_mins)?;
    if !manual.safety_margin.is_finite() || manual.safety_margin < 1.0 {
        bail!(
            "MANUAL_SAFETY_MARGIN must be a finite number >= 1.0, got {}",
            manual.safety_margin
        );
    }

    Ok(Config {
        db_url,
        destination_db_url,
        db_pool_max,
        bind_addr,
        tick_interval: Duration::from_millis(tick_ms),
        sync_interval: Duration::from_secs(sync_secs),
        mapping_refresh: Duration::from_secs(mapping_secs),
        retention_interval: Duration::from_secs(retention_secs),
        store_timeout: Duration::from_secs(timeout_secs),
        sync_chunk_size,
        sync_read_limit,
        sync_backfill,
        reading_retention,
        manual,
        mapping_fallback,
        sensors_file,
    })
}

/// Minutes to a window length, within `0..=MAX_WINDOW_MINS`.
fn window(name: &str, minutes: i64) -> Result<chrono::Duration> {
    // ---
    if !(0..=MAX_WINDOW_MINS).contains(&minutes) {
        bail!("{} must be between 0 and {}, got {}", name, MAX_WINDOW_MINS, minutes);
    }
    chrono::Duration::try_minutes(minutes).ok_or_else(|| anyhow!("{} out of range: {}", name, minutes))
}

/// Hide the password part of a connection string.
fn mask_db_url(url: &str) -> String {
    // ---
    let Some(at_pos) = url.rfind('@') else {
        return url.to_string();
    };
    let start = url
        .find("://")
        .map(|p| p + 3)
        .filter(|&p| p <= at_pos)
        .unwrap_or(0);

    match url[start..at_pos].find(':') {
        Some(rel) => format!("{}:****{}", &url[..start + rel], &url[at_pos..]),
        None => url.to_string(),
    }
}

/// Check a fleet definition before it is turned into sensors.
pub fn validate_specs(specs: &[SensorSpec]) -> Result<()> {
    // ---
    if specs.is_empty() {
        bail!("sensor fleet is empty");
    }

    let mut seen = HashSet::new();
    for spec in specs {
        if spec.key.trim().is_empty() {
            bail!("sensor key must not be empty");
        }
        if !seen.insert(spec.key.as_str()) {
            bail!("duplicate sensor key '{}'", spec.key);
        }
        if !(spec.min.is_finite() && spec.max.is_finite() && spec.nominal.is_finite()) {
            bail!("sensor '{}' has non-finite bounds", spec.key);
        }
        if spec.min >= spec.max {
            bail!(
                "sensor '{}': min ({}) must be below max ({})",
                spec.key,
                spec.min,
                spec.max
            );
        }
        if spec.nominal < spec.min || spec.nominal > spec.max {
            bail!(
                "sensor '{}': nominal {} outside [{}, {}]",
                spec.key,
                spec.nominal,
                spec.min,
                spec.max
            );
        }
    }
    Ok(())
}

fn read_sensor_file(path: &Path) -> Result<Vec<SensorSpec>> {
    // ---
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read SENSORS_FILE '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse SENSORS_FILE '{}'", path.display()))
}

impl Config {
    // ---
    /// The fleet to simulate: `SENSORS_FILE` if set, else the built-in one.
    pub fn sensor_specs(&self) -> Result<Vec<SensorSpec>> {
        // ---
        let specs = match &self.sensors_file {
            Some(path) => read_sensor_file(path)?,
            None => default_fleet(),
        };
        validate_specs(&specs)?;
        Ok(specs)
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            chunk_size: self.sync_chunk_size,
            read_limit: self.sync_read_limit,
            store_timeout: self.store_timeout,
        }
    }

    /// Whether the bridge writes into the same database it reads from.
    pub fn shared_database(&self) -> bool {
        self.db_url == self.destination_db_url
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Database passwords are masked.
    pub fn log_config(&self) {
        // ---
        let sensors = self
            .sensors_file
            .as_ref()
            .map_or_else(|| "(built-in fleet)".to_string(), |p| p.display().to_string());

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL              : {}", mask_db_url(&self.db_url));
        tracing::info!(
            "  DESTINATION_DATABASE_URL  : {}",
            mask_db_url(&self.destination_db_url)
        );
        tracing::info!("  DB_POOL_MAX               : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR                 : {}", self.bind_addr);
        tracing::info!("  TICK_INTERVAL             : {:?}", self.tick_interval);
        tracing::info!("  SYNC_INTERVAL             : {:?}", self.sync_interval);
        tracing::info!("  MAPPING_REFRESH           : {:?}", self.mapping_refresh);
        tracing::info!("  RETENTION_INTERVAL        : {:?}", self.retention_interval);
        tracing::info!("  STORE_TIMEOUT             : {:?}", self.store_timeout);
        tracing::info!("  SYNC_CHUNK_SIZE           : {}", self.sync_chunk_size);
        tracing::info!("  SYNC_READ_LIMIT           : {}", self.sync_read_limit);
        tracing::info!("  SYNC_BACKFILL_MINS        : {}", self.sync_backfill.num_minutes());
        tracing::info!(
            "  READING_RETENTION_MINS    : {}",
            self.reading_retention.num_minutes()
        );
        tracing::info!("  RESET_OVERRIDES_ON_NORMAL : {}", self.manual.reset_on_normal);
        tracing::info!("  MANUAL_BOUNDS_POLICY      : {:?}", self.manual.bounds);
        tracing::info!("  MANUAL_SAFETY_MARGIN      : {}", self.manual.safety_margin);
        tracing::info!("  MAPPING_FALLBACK          : {:?}", self.mapping_fallback);
        tracing::info!("  SENSORS_FILE              : {}", sensors);
    }
}
