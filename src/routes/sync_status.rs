use axum::{extract::State, routing::get, Json, Router};

use super::AppState;
use crate::bridge::SyncStatus;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/api/sync/status", get(handler))
}

/// `GET /api/sync/status`: cursor, last cycle summary and last error.
async fn handler(State((_, status)): State<AppState>) -> Json<SyncStatus> {
    Json(status.get())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::routes::test_support::app_state;

    #[tokio::test]
    async fn test_fresh_status() {
        // ---
        let Json(status) = handler(State(app_state())).await;
        assert!(status.cursor.is_none());
        assert!(status.last_summary.is_none());
        assert!(status.last_error.is_none());
        assert_eq!(status.cycles, 0);
    }
}
