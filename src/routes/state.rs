use axum::{extract::State, routing::get, Json, Router};

use super::AppState;
use crate::sensor::StateSnapshot;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/api/state", get(handler))
}

/// `GET /api/state`: active scenario plus every sensor.
async fn handler(State((sim, _)): State<AppState>) -> Json<StateSnapshot> {
    Json(sim.snapshot())
}
