//! Typed failures for the simulator and the bridge.
//!
//! Two families only: [`ValidationError`] is returned synchronously to
//! administrative callers, [`StoreError`] is raised by background ticks and
//! sync cycles and retried on the next schedule. Startup failures stay on
//! `anyhow` and stop the process from `main`.

use std::time::Duration;

use thiserror::Error;

// ---

/// Rejected administrative input. Never crashes the engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    // ---
    #[error("unknown sensor '{key}'")]
    UnknownSensor { key: String },

    #[error("unknown scenario '{name}' (expected normal, fire, leak or power_failure)")]
    UnknownScenario { name: String },

    #[error("value for sensor '{key}' must be finite")]
    NonFiniteValue { key: String },

    #[error("value {value} for sensor '{key}' is outside the accepted range [{min}, {max}]")]
    OutOfBounds {
        key: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl ValidationError {
    /// Stable machine-readable code surfaced in administrative responses.
    pub fn reason_code(&self) -> &'static str {
        // ---
        match self {
            Self::UnknownSensor { .. } => "unknown_sensor",
            Self::UnknownScenario { .. } => "unknown_scenario",
            Self::NonFiniteValue { .. } => "non_finite_value",
            Self::OutOfBounds { .. } => "out_of_bounds",
        }
    }
}

/// Reading store or destination store failure.
///
/// All variants are treated as transient: the tick or cycle that hit them is
/// abandoned and the next scheduled run retries the same work.
#[derive(Debug, Error)]
pub enum StoreError {
    // ---
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("undecodable row: {0}")]
    Corrupt(String),
}
