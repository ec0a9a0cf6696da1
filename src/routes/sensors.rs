//! Single-sensor reads and manual overrides.

use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, State},
    routing::{delete, get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::sensor::SensorView;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/sensors/{key}", get(get_sensor))
        .route("/api/sensors/{key}/value", put(set_value))
        .route("/api/sensors/{key}/manual", delete(clear_manual))
}

#[derive(Debug, Deserialize)]
pub struct ValueRequest {
    value: f64,
}

#[derive(Debug, Serialize)]
pub struct SensorResponse {
    success: bool,
    sensor: SensorView,
}

/// `GET /api/sensors/{key}`: current value and override flag.
async fn get_sensor(
    State((sim, _)): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SensorResponse>, ApiError> {
    // ---
    let sensor = sim.sensor(&key)?;
    Ok(Json(SensorResponse {
        success: true,
        sensor,
    }))
}

/// `PUT /api/sensors/{key}/value`: pin a sensor until cleared.
async fn set_value(
    State((sim, _)): State<AppState>,
    Path(key): Path<String>,
    body: Result<Json<ValueRequest>, JsonRejection>,
) -> Result<Json<SensorResponse>, ApiError> {
    // ---
    let Json(request) = body?;
    let sensor = sim.set_manual(&key, request.value)?;
    Ok(Json(SensorResponse {
        success: true,
        sensor,
    }))
}

/// `DELETE /api/sensors/{key}/manual`: resume automatic updates.
async fn clear_manual(
    State((sim, _)): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SensorResponse>, ApiError> {
    // ---
    let sensor = sim.clear_manual(&key)?;
    Ok(Json(SensorResponse {
        success: true,
        sensor,
    }))
}
