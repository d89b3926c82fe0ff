//! HTTP route definitions.

mod diagnostics;
mod error;
mod events;
mod health;
mod kiosk;
mod mode;
mod students;
mod sync;

pub use error::{AppError, Result};

use crate::app::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .merge(diagnostics::routes())
        .merge(kiosk::routes())
        .merge(students::routes())
        .merge(mode::routes())
        .merge(events::routes())
}
