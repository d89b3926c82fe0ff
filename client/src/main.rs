//! Rollcall Kiosk - local HTTP and WebSocket surface over the data service.
//!
//! Serves kiosk scans, sync status, diagnostics and a live event stream for
//! the screens running on the device.

use rollcall_client::app::{self, AppState};
use rollcall_client::{Config, DataService};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rollcall_client=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        mode = %config.mode,
        data_dir = %config.data_dir.display(),
        "Starting Rollcall Kiosk on {}:{}",
        config.host,
        config.port
    );

    let service = Arc::new(DataService::from_config(&config).await?);
    let state = AppState::new(service.clone(), config.clone());
    let _status_feed = app::broadcast_sync_status(&state);

    // Warm the roster so the first scan is fast.
    match service.preload_for_kiosk().await {
        Ok(students) => tracing::info!(students, "Kiosk roster ready"),
        Err(e) => tracing::warn!(error = %e, "Kiosk preload failed, will load on first scan"),
    }

    let app = app::router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
