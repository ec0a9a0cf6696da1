//! Simulated sensors and the shared, lock-guarded simulator state.
//!
//! [`SimHandle`] is the single owner of mutable simulator state (active
//! scenario, current values, manual flags). It is cloned into the scenario
//! engine, the administrative router and anything else that needs to look at
//! or poke the field. The lock is only ever held for one read-modify-write and
//! never across an `.await`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::error::ValidationError;
use crate::models::{SensorCategory, SensorSpec, ZoneId};
use crate::scenario::Scenario;

// ---

/// What to do with a manual value that lies outside a sensor's physical
/// bounds while the field is in `normal` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsPolicy {
    // ---
    /// Clamp to bounds, provided the value is within the safety margin.
    Clamp,
    /// Reject anything outside bounds.
    Reject,
}

impl FromStr for BoundsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clamp" => Ok(Self::Clamp),
            "reject" => Ok(Self::Reject),
            other => Err(format!("expected 'clamp' or 'reject', got '{}'", other)),
        }
    }
}

/// Manual-override rules, fixed at startup from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ManualPolicy {
    // ---
    pub bounds: BoundsPolicy,

    /// Multiple of the bounds' half-span (around their center) beyond which a
    /// manual value is always rejected under `normal`.
    pub safety_margin: f64,

    /// Switching to `normal` clears every manual override.
    pub reset_on_normal: bool,
}

impl Default for ManualPolicy {
    fn default() -> Self {
        Self {
            bounds: BoundsPolicy::Clamp,
            safety_margin: 2.0,
            reset_on_normal: true,
        }
    }
}

/// One simulated sensor.
#[derive(Debug, Clone)]
pub struct Sensor {
    // ---
    pub key: String,
    pub zone_id: ZoneId,
    pub category: SensorCategory,
    pub min: f64,
    pub max: f64,
    pub unit: String,
    pub nominal: f64,
    pub value: f64,
    pub manual: bool,
}

impl Sensor {
    // ---
    pub fn from_spec(spec: &SensorSpec) -> Self {
        // ---
        Sensor {
            key: spec.key.clone(),
            zone_id: spec.zone_id,
            category: spec.category,
            min: spec.min,
            max: spec.max,
            unit: spec
                .unit
                .clone()
                .unwrap_or_else(|| spec.category.default_unit().to_string()),
            nominal: spec.nominal,
            value: spec.nominal,
            manual: false,
        }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Outer limits `center ± margin * half_span`.
    fn safety_limits(&self, margin: f64) -> (f64, f64) {
        // ---
        let center = (self.min + self.max) / 2.0;
        let half = (self.max - self.min) / 2.0 * margin;
        (center - half, center + half)
    }

    /// Apply the bounds policy to a finite manual value under `normal`.
    fn admit_manual(&self, value: f64, policy: &ManualPolicy) -> Result<f64, ValidationError> {
        // ---
        if value >= self.min && value <= self.max {
            return Ok(value);
        }

        let (low, high) = match policy.bounds {
            BoundsPolicy::Clamp => self.safety_limits(policy.safety_margin),
            BoundsPolicy::Reject => (self.min, self.max),
        };

        if policy.bounds == BoundsPolicy::Clamp && value >= low && value <= high {
            return Ok(self.clamp(value));
        }

        Err(ValidationError::OutOfBounds {
            key: self.key.clone(),
            value,
            min: low,
            max: high,
        })
    }

    pub fn view(&self) -> SensorView {
        // ---
        SensorView {
            key: self.key.clone(),
            zone_id: self.zone_id,
            category: self.category,
            unit: self.unit.clone(),
            min: self.min,
            max: self.max,
            value: self.value,
            manual: self.manual,
            alert: self.category.is_alert(self.value),
        }
    }
}

/// Read-only view of a sensor returned to administrative callers.
#[derive(Debug, Clone, Serialize)]
pub struct SensorView {
    // ---
    pub key: String,
    pub zone_id: ZoneId,
    pub category: SensorCategory,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub value: f64,
    pub manual: bool,
    pub alert: bool,
}

/// Snapshot of the whole field.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    // ---
    pub scenario: Scenario,
    pub sensors: Vec<SensorView>,
}

/// Mutable simulator state. Only reachable through [`SimHandle`].
#[derive(Debug)]
pub struct SimState {
    // ---
    pub(crate) scenario: Scenario,
    pub(crate) sensors: BTreeMap<String, Sensor>,
    policy: ManualPolicy,
}

impl SimState {
    fn sensor(&self, key: &str) -> Result<&Sensor, ValidationError> {
        self.sensors
            .get(key)
            .ok_or_else(|| ValidationError::UnknownSensor {
                key: key.to_string(),
            })
    }

    fn sensor_mut(&mut self, key: &str) -> Result<&mut Sensor, ValidationError> {
        self.sensors
            .get_mut(key)
            .ok_or_else(|| ValidationError::UnknownSensor {
                key: key.to_string(),
            })
    }
}

/// Shared handle over the simulator state.
#[derive(Debug, Clone)]
pub struct SimHandle {
    inner: Arc<Mutex<SimState>>,
}

impl SimHandle {
    // ---
    pub fn new(specs: &[SensorSpec], policy: ManualPolicy) -> Self {
        // ---
        let sensors = specs
            .iter()
            .map(|spec| (spec.key.clone(), Sensor::from_spec(spec)))
            .collect();

        SimHandle {
            inner: Arc::new(Mutex::new(SimState {
                scenario: Scenario::Normal,
                sensors,
                policy,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking writer cannot leave a sensor half-updated, so the
        // poisoned state is still consistent.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `f` with exclusive access to the state. Used by the scenario tick.
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Current view of one sensor.
    pub fn sensor(&self, key: &str) -> Result<SensorView, ValidationError> {
        self.lock().sensor(key).map(Sensor::view)
    }

    #[cfg(test)]
    pub fn get_value(&self, key: &str) -> Result<f64, ValidationError> {
        self.lock().sensor(key).map(|s| s.value)
    }

    #[cfg(test)]
    pub fn is_manual(&self, key: &str) -> Result<bool, ValidationError> {
        self.lock().sensor(key).map(|s| s.manual)
    }

    /// Pin a sensor to an operator-supplied value.
    ///
    /// Under `normal` the configured [`BoundsPolicy`] applies; during a
    /// disturbance scenario any finite value is accepted as-is.
    pub fn set_manual(&self, key: &str, value: f64) -> Result<SensorView, ValidationError> {
        // ---
        let mut state = self.lock();
        let scenario = state.scenario;
        let policy = state.policy;
        let sensor = state.sensor_mut(key)?;

        if !value.is_finite() {
            return Err(ValidationError::NonFiniteValue {
                key: key.to_string(),
            });
        }

        let accepted = if scenario == Scenario::Normal {
            sensor.admit_manual(value, &policy)?
        } else {
            value
        };

        sensor.value = accepted;
        sensor.manual = true;

        tracing::info!(sensor = key, requested = value, accepted, "manual override set");
        Ok(sensor.view())
    }

    /// Hand a sensor back to automatic tick updates.
    pub fn clear_manual(&self, key: &str) -> Result<SensorView, ValidationError> {
        // ---
        let mut state = self.lock();
        let sensor = state.sensor_mut(key)?;
        if sensor.manual {
            sensor.manual = false;
            tracing::info!(sensor = key, "manual override cleared");
        }
        Ok(sensor.view())
    }

    pub fn scenario(&self) -> Scenario {
        self.lock().scenario
    }

    /// Replace the active scenario; effective from the next tick.
    ///
    /// Returns the keys whose manual overrides were cleared as a consequence
    /// (only when switching to `normal` with `reset_on_normal` enabled).
    pub fn set_scenario(&self, scenario: Scenario) -> Vec<String> {
        // ---
        let mut state = self.lock();
        let previous = state.scenario;
        state.scenario = scenario;

        let mut cleared = Vec::new();
        if scenario == Scenario::Normal && state.policy.reset_on_normal {
            for sensor in state.sensors.values_mut().filter(|s| s.manual) {
                sensor.manual = false;
                cleared.push(sensor.key.clone());
            }
        }

        tracing::info!(
            from = %previous,
            to = %scenario,
            cleared_overrides = cleared.len(),
            "scenario switched"
        );
        cleared
    }

    pub fn snapshot(&self) -> StateSnapshot {
        // ---
        let state = self.lock();
        StateSnapshot {
            scenario: state.scenario,
            sensors: state.sensors.values().map(Sensor::view).collect(),
        }
    }

    pub fn sensor_count(&self) -> usize {
        self.lock().sensors.len()
    }
}
