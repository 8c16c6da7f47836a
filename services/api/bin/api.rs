//! Main Entrypoint for the Parley API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the upstream engine for the configured provider.
//! 3. Creating the session manager and starting the session reaper.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and closing every session on shutdown.

use anyhow::Context;
use parley_api::{config::Config, provider, router::create_router, state::AppState};
use parley_core::SessionManager;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize the Session Manager ---
    let engine = provider::build_engine(&config)?;
    let manager = Arc::new(SessionManager::new(engine, config.turn_timings()));
    let reaper = manager.spawn_reaper(config.reaper_config());
    info!(
        ttl_secs = config.session_ttl.as_secs(),
        interval_secs = config.reap_interval.as_secs(),
        "Session reaper started."
    );

    let app_state = Arc::new(AppState {
        manager: manager.clone(),
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.realtime_model,
        bind_address = %config.bind_address,
        idle_window_ms = config.idle_window.as_millis() as u64,
        hard_timeout_ms = config.hard_timeout.as_millis() as u64,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    reaper.abort();
    manager.close_all().await;
    info!("Server has shut down.");
    Ok(())
}
