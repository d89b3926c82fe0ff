//! Diagnostics and dead-letter management.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use rollcall_engine::MutationRecord;

use crate::app::AppState;
use crate::diagnostics::DiagnosticResult;
use crate::routes::Result;

/// Create diagnostics routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/diagnostics", get(diagnostics_handler))
        .route(
            "/diagnostics/dead-letters/{id}",
            axum::routing::delete(discard_handler),
        )
        .route("/diagnostics/dead-letters/{id}/retry", post(retry_handler))
}

/// GET /diagnostics
async fn diagnostics_handler(State(state): State<AppState>) -> Json<Vec<DiagnosticResult>> {
    Json(state.service.run_diagnostics().await)
}

/// POST /diagnostics/dead-letters/{id}/retry
async fn retry_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MutationRecord>> {
    Ok(Json(state.service.retry_dead_letter(&id)?))
}

/// DELETE /diagnostics/dead-letters/{id}
async fn discard_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MutationRecord>> {
    Ok(Json(state.service.discard_dead_letter(&id)?))
}
