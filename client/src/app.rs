//! HTTP application wiring for the `rollcall-kiosk` binary.

use crate::bus::Subscription;
use crate::config::Config;
use crate::facade::DataService;
use crate::routes;
use crate::websocket::ConnectionManager;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DataService>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(service: Arc<DataService>, config: Config) -> Self {
        Self {
            service,
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the router with tracing and permissive CORS for kiosk screens.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Push every sync status change to all WebSocket connections.
pub fn broadcast_sync_status(state: &AppState) -> Subscription {
    let conn_manager = state.conn_manager.clone();
    state.service.on_sync_status_change(move |sync_state| {
        let sent = conn_manager.broadcast_status(sync_state);
        tracing::trace!(screens = sent, status = %sync_state.status, "broadcast sync status");
    })
}
