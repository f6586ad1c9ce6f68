//! # Voice Transport Core - Main Application Entry Point
//!
//! Real-time audio transport for a voice assistant: peers stream PCM in over WebSocket, the
//! audio is framed and fed to an AI pipeline, and synthesized speech is paced back out.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection runs as a handful of cooperative tokio tasks
//! - **modules**: one module per concern (mod statements below)
//! - **Result<T, E>**: startup failures propagate with `?` and end the process with a message
//! - **Arc**: the registry, error budget, breaker and degradation flags are shared by all workers
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared collaborators handed to handlers and socket actors
//! - **audio**: inbound buffering/framing and outbound playback pacing
//! - **connection**: connection registry and transport handle contract
//! - **resilience**: error budget, circuit breaker, graceful degradation
//! - **pipeline**: the AI pipeline seam and its echo implementation
//! - **stream**: per-connection task wiring
//! - **websocket**: the WebSocket peer transport
//! - **health** / **handlers**: HTTP endpoints
//! - **error**: error types and HTTP error responses

mod audio;
mod config;
mod connection;
mod error;
mod handlers;
mod health;
mod pipeline;
mod resilience;
mod state;
mod stream;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared state** and starts the connection registry's background tasks
/// 4. **Serves HTTP and WebSocket** routes
/// 5. **Shuts down gracefully** on SIGINT/SIGTERM, closing every peer connection
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-transport-core v{}", env!("CARGO_PKG_VERSION"));
    info!(
        max_connections = config.connections.max_connections,
        pipeline = %config.pipeline.mode,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let app_state = AppState::new(config.clone())?;
    app_state.registry.start();
    let registry = app_state.registry.clone();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/status", web::get().to(handlers::get_status))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    registry.stop();
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: overrides the filter, e.g. `voice_transport_core=trace`
/// - If not set, defaults to `voice_transport_core=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_transport_core=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve when SIGINT (Ctrl+C) or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
