//! # Beacon Server
//!
//! Realtime event distribution and presence server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with a config file in one of the searched locations
//! cp beacon.toml /etc/beacon/beacon.toml && beacon
//!
//! # Run with environment variables
//! BEACON__PORT=8080 BEACON__HOST=0.0.0.0 beacon
//! ```

mod config;
mod dispatch;
mod engine;
mod handlers;
mod metrics;
mod session;

use anyhow::{Context, Result};
use beacon_core::LocalBroker;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,beacon_core=debug,beacon_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    info!("Starting Beacon server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)?;
    }

    let broker = Arc::new(LocalBroker::new(config.events.broker_capacity));
    let authenticator = Arc::new(config.auth.authenticator());
    let engine = Engine::start(config.engine_config(), broker, authenticator)
        .await
        .context("Failed to start engine")?;

    let mut server = tokio::spawn(handlers::run_server(config, Arc::clone(&engine)));

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            None
        }
        result = &mut server => Some(result),
    };

    let report = engine.shutdown().await;
    if report.is_clean() {
        info!(notified = report.notified, "Shutdown complete");
    } else {
        for failure in &report.failures {
            warn!(component = %failure.component, error = %failure.error, "Shutdown step failed");
        }
    }

    let result = match early_exit {
        Some(result) => result,
        None => server.await,
    };
    result.context("HTTP server task failed")?
}
