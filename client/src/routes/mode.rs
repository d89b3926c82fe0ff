//! Storage mode selection.

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::config::Mode;
use crate::routes::Result;

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeBody {
    pub mode: Mode,
}

/// Create mode routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/mode", get(get_handler).put(put_handler))
}

/// GET /mode
async fn get_handler(State(state): State<AppState>) -> Json<ModeBody> {
    Json(ModeBody {
        mode: state.service.mode(),
    })
}

/// PUT /mode
async fn put_handler(
    State(state): State<AppState>,
    Json(body): Json<ModeBody>,
) -> Result<Json<ModeBody>> {
    state.service.set_mode(body.mode).await?;
    Ok(Json(ModeBody {
        mode: state.service.mode(),
    }))
}
