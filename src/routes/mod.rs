//! Administrative HTTP API gateway.
//!
//! Each sibling module exposes a subrouter over the shared [`AppState`]; this
//! module merges them and owns the error body every handler returns.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;

use crate::bridge::SyncStatusHandle;
use crate::error::ValidationError;
use crate::sensor::SimHandle;

mod health;
mod scenario;
mod sensors;
mod state;
mod sync_status;

// ---

/// State shared by every route.
pub type AppState = (SimHandle, SyncStatusHandle);

pub fn router(sim: SimHandle, status: SyncStatusHandle) -> Router {
    // ---
    Router::new()
        .merge(state::router())
        .merge(scenario::router())
        .merge(sensors::router())
        .merge(sync_status::router())
        .merge(health::router())
        .with_state((sim, status))
}

/// Error returned by admin handlers as
/// `{"success": false, "reason": ..., "error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    // ---
    Validation(ValidationError),
    InvalidBody(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(ValidationError::UnknownSensor { .. }) => StatusCode::NOT_FOUND,
            Self::Validation(_) | Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::Validation(err) => err.reason_code(),
            Self::InvalidBody(_) => "invalid_body",
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let message = match &self {
            Self::Validation(err) => err.to_string(),
            Self::InvalidBody(text) => text.clone(),
        };
        tracing::warn!(reason = self.reason(), "admin request rejected: {}", message);

        let body = json!({
            "success": false,
            "reason": self.reason(),
            "error": message,
        });
        (self.status(), Json(body)).into_response()
    }
}
