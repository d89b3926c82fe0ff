//! Liveness endpoint for the kiosk screens.

use axum::{extract::State, routing::get, Json, Router};
use rollcall_engine::SyncStatus;
use serde::Serialize;

use crate::app::AppState;
use crate::config::Mode;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub mode: Mode,
    pub sync: SyncStatus,
    pub screens: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(|| async { "Rollcall Kiosk" }))
}

/// GET /health - the service answers even while the remote is unreachable.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        mode: state.service.mode(),
        sync: state.service.sync_status().status,
        screens: state.conn_manager.connection_count(),
    })
}
