//! Logging and tracing setup
//!
//! Provides structured logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging for the process
///
/// Reads the log level from the `RUST_LOG` env var, defaulting to `info`.
///
/// Usage:
/// ```rust
/// haflow_common::init_tracing();
/// tracing::info!("daemon starting");
/// ```
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .try_init()
        .ok();
}

/// Initialize tracing with JSON output (for log aggregation systems)
pub fn init_tracing_json() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .ok();
}
