//! Sync status and manual flush.

use axum::{extract::State, routing::get, routing::post, Json, Router};
use rollcall_engine::SyncState;

use crate::app::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/status", get(status_handler))
        .route("/sync/flush", post(flush_handler))
}

/// GET /sync/status
async fn status_handler(State(state): State<AppState>) -> Json<SyncState> {
    Json(state.service.sync_status())
}

/// POST /sync/flush - Run one sync cycle now.
async fn flush_handler(State(state): State<AppState>) -> Json<SyncState> {
    Json(state.service.force_sync_now().await)
}
