//! Scenario engine: perturbs the simulated field once per tick.
//!
//! The engine is a small state machine over [`Scenario`]. The active scenario
//! lives in the shared [`SimHandle`] so administrative commands can switch it
//! at any time; the switch is picked up by the next tick. Every tick produces
//! one [`Reading`] per sensor and persists them as a single [`TickBatch`].
//!
//! Ticks are numbered. The sequence number only advances once the batch is
//! stored, so a failed tick is retried under the same number and the store's
//! `(sensor_key, tick_seq)` uniqueness keeps the retry from double-writing.
//!
//! Tick timestamps are strictly increasing even if the wall clock steps back,
//! so a new reading can never land at or behind the bridge's cursor.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SubsecRound, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, ValidationError};
use crate::models::{Reading, SensorCategory, TickBatch};
use crate::scheduler::Job;
use crate::sensor::{Sensor, SimHandle};
use crate::store::{self, ReadingStore};

// ---

/// The closed set of field-wide scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    // ---
    Normal,
    Fire,
    Leak,
    PowerFailure,
}

impl Scenario {
    // ---
    pub const ALL: [Scenario; 4] = [
        Scenario::Normal,
        Scenario::Fire,
        Scenario::Leak,
        Scenario::PowerFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            Self::Normal => "normal",
            Self::Fire => "fire",
            Self::Leak => "leak",
            Self::PowerFailure => "power_failure",
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.as_str() == wanted)
            .ok_or_else(|| ValidationError::UnknownScenario {
                name: s.to_string(),
            })
    }
}

/// Per-scenario, per-category step sizes.
///
/// Ranges are inclusive `(low, high)` bounds for a uniform draw.
#[derive(Debug, Clone)]
pub struct ScenarioTuning {
    // ---
    /// Fraction of the distance to nominal recovered per `normal` tick.
    pub reversion: f64,
    pub temperature_noise: f64,
    pub humidity_noise: f64,
    pub co2_noise: f64,
    pub pressure_noise: f64,

    pub fire_temperature_rise: (f64, f64),
    pub fire_co2_rise: (f64, f64),
    pub fire_humidity_drop: (f64, f64),

    pub leak_pressure_drop: (f64, f64),
    pub leak_temperature_drop: (f64, f64),
    pub leak_humidity_rise: (f64, f64),

    /// Value every automatic sensor reports while the field is unpowered.
    pub unpowered_value: f64,
}

impl Default for ScenarioTuning {
    fn default() -> Self {
        Self {
            reversion: 0.1,
            temperature_noise: 0.2,
            humidity_noise: 0.5,
            co2_noise: 10.0,
            pressure_noise: 0.5,
            fire_temperature_rise: (1.0, 3.0),
            fire_co2_rise: (20.0, 60.0),
            fire_humidity_drop: (0.5, 1.5),
            leak_pressure_drop: (2.0, 5.0),
            leak_temperature_drop: (0.0, 0.2),
            leak_humidity_rise: (0.5, 1.5),
            unpowered_value: 0.0,
        }
    }
}

impl ScenarioTuning {
    fn noise(&self, category: SensorCategory) -> f64 {
        // ---
        match category {
            SensorCategory::Temperature => self.temperature_noise,
            SensorCategory::Humidity => self.humidity_noise,
            SensorCategory::Co2 => self.co2_noise,
            SensorCategory::Pressure => self.pressure_noise,
        }
    }

    /// Next automatic value for `sensor` under `scenario`.
    fn step<G: Rng>(&self, scenario: Scenario, sensor: &Sensor, rng: &mut G) -> f64 {
        // ---
        let value = sensor.value;
        match scenario {
            Scenario::Normal => {
                let noise = self.noise(sensor.category);
                let drift = (sensor.nominal - value) * self.reversion;
                sensor.clamp(value + drift + rng.gen_range(-noise..=noise))
            }
            // No upper clamp: a fire is supposed to leave the normal envelope.
            Scenario::Fire => match sensor.category {
                SensorCategory::Temperature => value + draw(rng, self.fire_temperature_rise),
                SensorCategory::Co2 => value + draw(rng, self.fire_co2_rise),
                SensorCategory::Humidity => (value - draw(rng, self.fire_humidity_drop)).max(0.0),
                SensorCategory::Pressure => value,
            },
            Scenario::Leak => match sensor.category {
                SensorCategory::Pressure => (value - draw(rng, self.leak_pressure_drop)).max(0.0),
                SensorCategory::Temperature => value - draw(rng, self.leak_temperature_drop),
                SensorCategory::Humidity => (value + draw(rng, self.leak_humidity_rise)).min(100.0),
                SensorCategory::Co2 => value,
            },
            Scenario::PowerFailure => self.unpowered_value,
        }
    }
}

fn draw<G: Rng>(rng: &mut G, (low, high): (f64, f64)) -> f64 {
    rng.gen_range(low..=high)
}

/// Outcome of a successful tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    // ---
    pub tick_seq: u64,
    pub scenario: Scenario,
    pub readings: usize,
    pub inserted: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Drives the field forward one tick at a time.
pub struct ScenarioEngine {
    // ---
    sim: SimHandle,
    tuning: ScenarioTuning,
    rng: StdRng,
    next_seq: u64,
    /// Timestamp given to the previous batch.
    last_recorded_at: Option<DateTime<Utc>>,
}

impl ScenarioEngine {
    // ---
    /// `next_seq` is the first tick number to use, normally one past the
    /// highest number already in the reading store.
    pub fn new(sim: SimHandle, tuning: ScenarioTuning, next_seq: u64) -> Self {
        Self::with_rng(sim, tuning, next_seq, StdRng::from_entropy())
    }

    pub fn with_rng(sim: SimHandle, tuning: ScenarioTuning, next_seq: u64, rng: StdRng) -> Self {
        ScenarioEngine {
            sim,
            tuning,
            rng,
            next_seq,
            last_recorded_at: None,
        }
    }

    /// Issue every later timestamp strictly after `floor`, normally the
    /// newest stored reading or the sync cursor.
    pub fn resume_after(mut self, floor: Option<DateTime<Utc>>) -> Self {
        self.last_recorded_at = self.last_recorded_at.max(floor);
        self
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// `now` at microsecond precision, or one microsecond past the previous
    /// batch when the clock has not moved forward.
    fn next_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        // ---
        // Microsecond precision round-trips through TIMESTAMPTZ unchanged.
        let now = now.trunc_subsecs(6);
        let recorded_at = match self.last_recorded_at {
            Some(last) if now <= last => {
                let bumped = last + chrono::Duration::microseconds(1);
                tracing::warn!(clock = %now, issued = %bumped, "wall clock behind last tick");
                bumped
            }
            _ => now,
        };
        self.last_recorded_at = Some(recorded_at);
        recorded_at
    }

    /// Compute the next values for every automatic sensor and capture one
    /// reading per sensor. Holds the state lock only for this computation.
    pub fn advance(&mut self, now: DateTime<Utc>) -> TickBatch {
        // ---
        let recorded_at = self.next_timestamp(now);
        let tick_seq = self.next_seq;
        let tuning = &self.tuning;
        let rng = &mut self.rng;

        self.sim.with_state(|state| {
            let scenario = state.scenario;
            let readings = state
                .sensors
                .values_mut()
                .map(|sensor| {
                    if !sensor.manual {
                        sensor.value = tuning.step(scenario, sensor, &mut *rng);
                    }
                    Reading {
                        tick_seq,
                        sensor_key: sensor.key.clone(),
                        zone_id: sensor.zone_id,
                        category: sensor.category,
                        value: sensor.value,
                        unit: sensor.unit.clone(),
                        recorded_at,
                    }
                })
                .collect();

            TickBatch {
                tick_seq,
                scenario,
                recorded_at,
                readings,
            }
        })
    }

    /// Advance the field and persist the tick's readings.
    ///
    /// On failure the sequence number is left untouched; the next call
    /// recomputes values with fresh randomness and retries under the same
    /// number.
    pub async fn tick<R: ReadingStore>(
        &mut self,
        store: &R,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<TickReport, StoreError> {
        // ---
        let batch = self.advance(now);
        let inserted = store::timed("append readings", timeout, store.append(&batch)).await?;

        self.next_seq += 1;
        Ok(TickReport {
            tick_seq: batch.tick_seq,
            scenario: batch.scenario,
            readings: batch.readings.len(),
            inserted,
            recorded_at: batch.recorded_at,
        })
    }
}

/// Periodic job wrapping [`ScenarioEngine::tick`].
pub struct ScenarioJob<R> {
    // ---
    engine: ScenarioEngine,
    store: Arc<R>,
    timeout: Duration,
}

impl<R: ReadingStore> ScenarioJob<R> {
    pub fn new(engine: ScenarioEngine, store: Arc<R>, timeout: Duration) -> Self {
        Self {
            engine,
            store,
            timeout,
        }
    }
}

impl<R: ReadingStore> Job for ScenarioJob<R> {
    fn name(&self) -> &'static str {
        "scenario-tick"
    }

    async fn run_once(&mut self) -> Result<()> {
        // ---
        let report = self
            .engine
            .tick(self.store.as_ref(), Utc::now(), self.timeout)
            .await?;

        tracing::debug!(
            tick_seq = report.tick_seq,
            scenario = %report.scenario,
            readings = report.readings,
            inserted = report.inserted,
            recorded_at = %report.recorded_at,
            "tick persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{default_fleet, SensorSpec};
    use crate::sensor::ManualPolicy;
    use crate::store::memory::MemoryReadingStore;
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn engine(specs: &[SensorSpec]) -> (SimHandle, ScenarioEngine) {
        // ---
        let sim = SimHandle::new(specs, ManualPolicy::default());
        let engine = ScenarioEngine::with_rng(
            sim.clone(),
            ScenarioTuning::default(),
            0,
            StdRng::seed_from_u64(7),
        );
        (sim, engine)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap()
    }

    fn values(sim: &SimHandle, category: SensorCategory) -> Vec<f64> {
        sim.snapshot()
            .sensors
            .into_iter()
            .filter(|s| s.category == category)
            .map(|s| s.value)
            .collect()
    }

    #[test]
    fn test_scenario_from_str() {
        // ---
        assert_eq!("fire".parse::<Scenario>(), Ok(Scenario::Fire));
        assert_eq!(" Power-Failure ".parse::<Scenario>(), Ok(Scenario::PowerFailure));
        assert_eq!("power_failure".parse::<Scenario>(), Ok(Scenario::PowerFailure));

        let err = "flood".parse::<Scenario>().unwrap_err();
        assert_eq!(err.reason_code(), "unknown_scenario");
    }

    #[test]
    fn test_fire_temperature_non_decreasing() {
        // ---
        let (sim, mut engine) = engine(&default_fleet());
        sim.set_scenario(Scenario::Fire);

        let mut previous = values(&sim, SensorCategory::Temperature);
        let pressure_before = values(&sim, SensorCategory::Pressure);
        for i in 0..45 {
            engine.advance(t0() + chrono::Duration::seconds(i));
            let current = values(&sim, SensorCategory::Temperature);
            for (before, after) in previous.iter().zip(&current) {
                assert!(after >= before, "temperature fell from {} to {}", before, after);
            }
            previous = current;
        }

        // 45 ticks of at least +1.0 each, with no upper clamp.
        assert!(previous.iter().all(|t| *t > 60.0));
        assert_eq!(values(&sim, SensorCategory::Pressure), pressure_before);
    }

    #[test]
    fn test_leak_drains_pressure_to_zero() {
        // ---
        let (sim, mut engine) = engine(&default_fleet());
        sim.set_scenario(Scenario::Leak);

        let mut previous = values(&sim, SensorCategory::Pressure);
        for i in 0..600 {
            engine.advance(t0() + chrono::Duration::seconds(i));
            let current = values(&sim, SensorCategory::Pressure);
            for (before, after) in previous.iter().zip(&current) {
                assert!(after <= before);
                assert!(*after >= 0.0);
            }
            previous = current;
        }
        assert!(previous.iter().all(|p| *p == 0.0));
        assert!(values(&sim, SensorCategory::Humidity)
            .iter()
            .all(|h| *h <= 100.0));
    }

    #[test]
    fn test_power_failure_reports_unpowered_value() {
        // ---
        let (sim, mut engine) = engine(&default_fleet());
        assert_ok!(sim.set_manual("zone2_co2", 800.0));
        sim.set_scenario(Scenario::PowerFailure);

        let batch = engine.advance(t0());
        for reading in &batch.readings {
            if reading.sensor_key == "zone2_co2" {
                assert_eq!(reading.value, 800.0);
            } else {
                assert_eq!(reading.value, 0.0, "{} still powered", reading.sensor_key);
            }
        }
    }

    #[test]
    fn test_manual_override_survives_every_scenario() {
        // ---
        let (sim, mut engine) = engine(&default_fleet());
        assert_ok!(sim.set_manual("zone1_humidity", 99.9));

        for scenario in [Scenario::Normal, Scenario::Fire, Scenario::Leak, Scenario::PowerFailure] {
            if scenario != Scenario::Normal {
                sim.set_scenario(scenario);
            }
            engine.advance(t0());
            assert_eq!(sim.get_value("zone1_humidity"), Ok(99.9));
        }
    }

    #[test]
    fn test_normal_resumes_within_bounds() {
        // ---
        let (sim, mut engine) = engine(&default_fleet());
        sim.set_scenario(Scenario::Fire);
        for i in 0..30 {
            engine.advance(t0() + chrono::Duration::seconds(i));
        }
        sim.set_scenario(Scenario::PowerFailure);
        engine.advance(t0() + chrono::Duration::seconds(30));

        sim.set_scenario(Scenario::Normal);
        for i in 31..80 {
            engine.advance(t0() + chrono::Duration::seconds(i));
            for s in sim.snapshot().sensors {
                assert!(
                    s.value >= s.min && s.value <= s.max,
                    "{} = {} outside [{}, {}]",
                    s.key,
                    s.value,
                    s.min,
                    s.max
                );
            }
        }
    }

    #[test]
    fn test_cleared_override_drifts_again() {
        // ---
        let (sim, mut engine) = engine(&default_fleet());
        sim.set_scenario(Scenario::Fire);
        assert_ok!(sim.set_manual("zone1_temp", 200.0));
        assert_ok!(sim.clear_manual("zone1_temp"));
        sim.set_scenario(Scenario::Normal);

        engine.advance(t0());
        let value = assert_ok!(sim.get_value("zone1_temp"));
        assert!((-20.0..=60.0).contains(&value));
    }

    #[test]
    fn test_advance_does_not_consume_sequence() {
        // ---
        let (_sim, mut engine) = engine(&default_fleet());
        let batch = engine.advance(t0() + chrono::Duration::nanoseconds(1_234_567));
        assert_eq!(batch.tick_seq, 0);
        assert_eq!(engine.next_seq(), 0);
        assert_eq!(batch.readings.len(), 20);
        assert_eq!(
            batch.recorded_at,
            t0() + chrono::Duration::microseconds(1_234)
        );
        assert!(batch.readings.iter().all(|r| r.recorded_at == batch.recorded_at));
    }

    #[tokio::test]
    async fn test_tick_persists_one_reading_per_sensor() {
        // ---
        let (_sim, mut engine) = engine(&default_fleet());
        let store = MemoryReadingStore::default();

        let report = assert_ok!(engine.tick(&store, t0(), TIMEOUT).await);
        assert_eq!(report.tick_seq, 0);
        assert_eq!(report.readings, 20);
        assert_eq!(report.inserted, 20);
        assert_eq!(engine.next_seq(), 1);

        assert_ok!(engine.tick(&store, t0() + chrono::Duration::seconds(1), TIMEOUT).await);
        assert_eq!(store.len(), 40);
    }

    #[tokio::test]
    async fn test_failed_tick_retries_same_sequence() {
        // ---
        let (_sim, mut engine) = engine(&default_fleet());
        let store = MemoryReadingStore::default();

        store.fail_next_appends(1);
        assert_err!(engine.tick(&store, t0(), TIMEOUT).await);
        assert_eq!(engine.next_seq(), 0);
        assert_eq!(store.len(), 0);

        let report = assert_ok!(engine.tick(&store, t0() + chrono::Duration::seconds(1), TIMEOUT).await);
        assert_eq!(report.tick_seq, 0);
        assert_eq!(store.len(), 20);
    }

    #[tokio::test]
    async fn test_retry_after_committed_append_does_not_double_write() {
        // ---
        let (_sim, mut engine) = engine(&default_fleet());
        let store = MemoryReadingStore::default();

        // The append commits but the caller sees a failure (e.g. timeout
        // after commit), so the retry reuses tick 0.
        store.fail_next_appends_after_commit(1);
        assert_err!(engine.tick(&store, t0(), TIMEOUT).await);
        assert_eq!(store.len(), 20);

        let report = assert_ok!(engine.tick(&store, t0() + chrono::Duration::seconds(1), TIMEOUT).await);
        assert_eq!(report.tick_seq, 0);
        assert_eq!(report.inserted, 0);
        assert_eq!(store.len(), 20);
        assert_eq!(engine.next_seq(), 1);
    }

    #[test]
    fn test_timestamps_strictly_increase_when_clock_steps_back() {
        // ---
        let (_sim, mut engine) = engine(&default_fleet());
        let first = engine.advance(t0());
        let second = engine.advance(t0() - chrono::Duration::seconds(2));
        let third = engine.advance(t0());
        let fourth = engine.advance(t0() + chrono::Duration::seconds(1));

        assert_eq!(first.recorded_at, t0());
        assert_eq!(second.recorded_at, t0() + chrono::Duration::microseconds(1));
        assert_eq!(third.recorded_at, t0() + chrono::Duration::microseconds(2));
        assert_eq!(fourth.recorded_at, t0() + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_resume_after_floor() {
        // ---
        let (sim, _) = engine(&default_fleet());
        let mut engine = ScenarioEngine::with_rng(
            sim,
            ScenarioTuning::default(),
            5,
            StdRng::seed_from_u64(7),
        )
        .resume_after(Some(t0()));

        let batch = engine.advance(t0() - chrono::Duration::minutes(10));
        assert_eq!(batch.recorded_at, t0() + chrono::Duration::microseconds(1));
        assert_eq!(batch.tick_seq, 5);
    }

    #[tokio::test]
    async fn test_report_carries_scenario_applied_to_batch() {
        // ---
        let (sim, mut engine) = engine(&default_fleet());
        let store = MemoryReadingStore::default();

        sim.set_scenario(Scenario::Leak);
        let batch = engine.advance(t0());
        assert_eq!(batch.scenario, Scenario::Leak);

        sim.set_scenario(Scenario::Fire);
        let report = assert_ok!(engine.tick(&store, t0() + chrono::Duration::seconds(1), TIMEOUT).await);
        assert_eq!(report.scenario, Scenario::Fire);
        assert_eq!(report.recorded_at, t0() + chrono::Duration::seconds(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out_tick() {
        // ---
        let (_sim, mut engine) = engine(&default_fleet());
        let store = MemoryReadingStore::default();

        store.delay_appends(Duration::from_secs(30));
        let err = assert_err!(engine.tick(&store, t0(), TIMEOUT).await);
        assert!(matches!(err, StoreError::Timeout { op: "append readings", .. }));
        assert_eq!(engine.next_seq(), 0);
        assert_eq!(store.len(), 0);

        store.delay_appends(Duration::ZERO);
        let report = assert_ok!(engine.tick(&store, t0() + chrono::Duration::seconds(1), TIMEOUT).await);
        assert_eq!(report.tick_seq, 0);
        assert_eq!(store.len(), 20);
    }
}
