use axum::{extract::rejection::JsonRejection, extract::State, routing::put, Json, Router};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::scenario::Scenario;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/api/scenario", put(handler))
}

#[derive(Debug, Deserialize)]
pub struct ScenarioRequest {
    scenario: String,
}

#[derive(Debug, Serialize)]
pub struct ScenarioResponse {
    success: bool,
    scenario: Scenario,
    cleared_overrides: Vec<String>,
}

/// `PUT /api/scenario`: switch the whole field, effective from the next tick.
async fn handler(
    State((sim, _)): State<AppState>,
    body: Result<Json<ScenarioRequest>, JsonRejection>,
) -> Result<Json<ScenarioResponse>, ApiError> {
    // ---
    let Json(request) = body?;
    let scenario: Scenario = request.scenario.parse()?;
    let cleared_overrides = sim.set_scenario(scenario);

    Ok(Json(ScenarioResponse {
        success: true,
        scenario,
        cleared_overrides,
    }))
}
