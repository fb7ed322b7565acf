//! Metrics Sender - Periodic device telemetry service
//!
//! This service samples device health metrics every send period, builds a
//! bounded JSON document and posts it to a metrics database.
//!
//! ## Features
//!
//! - Dedicated sender thread with a configurable stack size
//! - Fixed-capacity document buffer, oversized entries are dropped
//! - Readiness gate on network reachability and clock validity
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `METRICS_SENDER_DATABASE_URL`: Database URL (default: http://localhost:8086/metrics)
//! - `METRICS_SENDER_DEVICE_LOCATION`: Location path segment (default: default-location)
//! - `METRICS_SENDER_BUFFER_SIZE`: Document buffer in bytes (default: 2048)
//! - `METRICS_SENDER_SEND_PERIOD_SECS`: Seconds between cycles (default: 300)
//! - `METRICS_SENDER_DOCUMENT_LAYOUT`: `flat` or `fields` (default: fields)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use metrics_sender::config::Config;
use metrics_sender::module::MetricsModule;
use metrics_sender::platform::Platform;

/// Upper bound on waiting for an in-flight cycle during shutdown
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Metrics Sender service...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                database_url = %config.database_url,
                location = %config.device_location,
                buffer_size = config.buffer_size,
                send_period_secs = config.send_period.as_secs(),
                layout = ?config.document_layout,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let mut module = MetricsModule::new(config, None, None, None, Platform::host());
    info!(device_id = %module.identity(), "Device identity generated");

    if let Err(e) = module.start() {
        error!(error = %e, "Failed to start metrics module");
        std::process::exit(1);
    }

    // Wait for shutdown signal
    info!("Metrics Sender running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    // Stopping joins the sender thread, keep it off the async workers
    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    let stop = tokio::task::spawn_blocking(move || module.stop());
    match tokio::time::timeout(shutdown_timeout, stop).await {
        Ok(Ok(Some(stats))) => {
            info!(
                cycles = stats.cycles,
                sent = stats.sent,
                send_failures = stats.send_failures,
                not_ready = stats.not_ready,
                rejected_entries = stats.rejected_entries,
                "Sender task shut down gracefully"
            );
        }
        Ok(Ok(None)) => {
            info!("Sender task was not running");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Sender task panicked during shutdown");
        }
        Err(_) => {
            warn!("Sender task shutdown timed out after {:?}", shutdown_timeout);
            // Dropping the runtime would wait on the blocked join
            std::process::exit(1);
        }
    }

    info!("Metrics Sender stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
