//! ENCORE Gateway Entry Point
//!
//! Boots tracing and configuration, wires the gateway, warms the backend
//! session, and runs until Ctrl-C.

use std::sync::Arc;

use encore_core::{ConfigError, GatewayError};
use encore_gateway::telemetry::{init_tracing, TelemetryConfig};
use encore_gateway::{GatewayConfig, GatewayState};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::util::TryInitError;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("Failed to initialize tracing: {0}")]
    Telemetry(#[from] TryInitError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start gateway: {0}")]
    Gateway(#[from] GatewayError),
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    init_tracing(&TelemetryConfig::default())?;

    let config = GatewayConfig::from_env()?;
    let state = Arc::new(GatewayState::start(config)?);

    // A failed warm-up is not fatal; the first call logs in again.
    let warmup = CancellationToken::new();
    tokio::select! {
        result = state.gateway().ensure_token(&warmup) => match result {
            Ok(()) => tracing::info!("Backend session established"),
            Err(e) => tracing::warn!(error = %e, class = ?e.class(), "Initial backend login failed"),
        },
        _ = tokio::signal::ctrl_c() => {
            warmup.cancel();
            tracing::info!("Shutdown signal received during startup");
            state.shutdown().await;
            return Ok(());
        }
    }

    tracing::info!("ENCORE gateway ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");

    state.shutdown().await;
    Ok(())
}
