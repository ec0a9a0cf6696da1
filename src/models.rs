//! Data models shared by the simulator, the reading store and the bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scenario::Scenario;

// ---

/// Logical grouping key (building/zone) shared by simulator readings and
/// destination sensors.
pub type ZoneId = i64;

/// Destination catalogue primary key.
pub type DestinationId = i64;

/// Physical quantity a sensor measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorCategory {
    // ---
    Temperature,
    Humidity,
    Co2,
    Pressure,
}

impl SensorCategory {
    // ---
    pub const ALL: [SensorCategory; 4] = [
        SensorCategory::Temperature,
        SensorCategory::Humidity,
        SensorCategory::Co2,
        SensorCategory::Pressure,
    ];

    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Co2 => "co2",
            Self::Pressure => "pressure",
        }
    }

    /// Parse the stored column form produced by [`SensorCategory::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        // ---
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    /// Derive a category from a free-form catalogue label.
    ///
    /// Dashboard operators name sensors in English or Russian, so both keyword
    /// sets are recognised. Matching is case-insensitive.
    pub fn from_label(label: &str) -> Option<Self> {
        // ---
        let label = label.to_lowercase();
        if label.contains("co2") {
            Some(Self::Co2)
        } else if label.contains("temp") || label.contains("температ") {
            Some(Self::Temperature)
        } else if label.contains("humid") || label.contains("влаж") {
            Some(Self::Humidity)
        } else if label.contains("press") || label.contains("давл") {
            Some(Self::Pressure)
        } else {
            None
        }
    }

    /// Short suffix used in generated sensor keys, e.g. `zone1_temp`.
    fn key_suffix(&self) -> &'static str {
        // ---
        match self {
            Self::Temperature => "temp",
            Self::Humidity => "humidity",
            Self::Co2 => "co2",
            Self::Pressure => "pressure",
        }
    }

    pub fn default_unit(&self) -> &'static str {
        // ---
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Co2 => "ppm",
            Self::Pressure => "hPa",
        }
    }

    /// Comfort band; values outside it raise an alert on the dashboard.
    pub fn comfort_range(&self) -> (f64, f64) {
        // ---
        match self {
            Self::Temperature => (18.0, 26.0),
            Self::Humidity => (30.0, 70.0),
            Self::Co2 => (0.0, 1000.0),
            Self::Pressure => (950.0, 1050.0),
        }
    }

    pub fn is_alert(&self, value: f64) -> bool {
        // ---
        let (low, high) = self.comfort_range();
        value < low || value > high
    }
}

impl std::fmt::Display for SensorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of one simulated sensor, as loaded from `SENSORS_FILE` or the
/// built-in fleet.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorSpec {
    // ---
    pub key: String,
    pub zone_id: ZoneId,
    pub category: SensorCategory,
    pub min: f64,
    pub max: f64,
    pub nominal: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Built-in fleet: five buildings, one sensor of each category per building.
pub fn default_fleet() -> Vec<SensorSpec> {
    // ---
    let base_temps = [20.0, 21.0, 23.0, 25.0, 26.0];
    let base_humidity = [47.0, 49.0, 51.0, 53.0, 55.0];

    let mut fleet = Vec::with_capacity(base_temps.len() * SensorCategory::ALL.len());
    for (idx, zone_id) in (1..=5).enumerate() {
        for category in SensorCategory::ALL {
            let (min, max, nominal) = match category {
                SensorCategory::Temperature => (-20.0, 60.0, base_temps[idx]),
                SensorCategory::Humidity => (0.0, 100.0, base_humidity[idx]),
                SensorCategory::Co2 => (300.0, 5000.0, 500.0),
                SensorCategory::Pressure => (900.0, 1100.0, 1013.0),
            };
            fleet.push(SensorSpec {
                key: format!("zone{}_{}", zone_id, category.key_suffix()),
                zone_id,
                category,
                min,
                max,
                nominal,
                unit: None,
            });
        }
    }
    fleet
}

/// Immutable timestamped reading written by the scenario tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    // ---
    pub tick_seq: u64,
    pub sensor_key: String,
    pub zone_id: ZoneId,
    pub category: SensorCategory,
    pub value: f64,
    pub unit: String,
    pub recorded_at: DateTime<Utc>,
}

/// One tick's worth of readings; persisted as a single unit.
#[derive(Debug, Clone)]
pub struct TickBatch {
    // ---
    pub tick_seq: u64,
    /// Scenario the batch was generated under.
    pub scenario: Scenario,
    pub recorded_at: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

/// Row written into the destination readings table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationRecord {
    // ---
    pub destination_id: DestinationId,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Sensor entry from the destination catalogue.
#[derive(Debug, Clone)]
pub struct CatalogueEntry {
    // ---
    pub id: DestinationId,
    pub name: String,
    pub zone_id: Option<ZoneId>,
    pub category: Option<SensorCategory>,
    pub bridge_eligible: bool,
}

impl CatalogueEntry {
    /// Declared category, else whatever the display name suggests.
    pub fn effective_category(&self) -> Option<SensorCategory> {
        // ---
        self.category
            .or_else(|| SensorCategory::from_label(&self.name))
    }
}
