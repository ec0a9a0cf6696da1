// src/routes/health.rs
//! Liveness endpoint.
//!
//! `GET /health` is used by container orchestrators and CI to check that the
//! service answers HTTP. It only reads in-memory state and never touches a
//! database, so a slow store cannot make the process look dead.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::scenario::Scenario;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    scenario: Scenario,
    sensors: usize,
    sync_cycles: u64,
    sync_failures: u64,
}

/// Handle `GET /health`.
async fn health(State((sim, status)): State<AppState>) -> Json<HealthResponse> {
    // ---
    let sync = status.get();
    Json(HealthResponse {
        status: "ok",
        scenario: sim.scenario(),
        sensors: sim.sensor_count(),
        sync_cycles: sync.cycles,
        sync_failures: sync.failures,
    })
}

/// Subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
