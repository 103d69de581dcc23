//! # Haflow Common Library
//!
//! Shared utilities and infrastructure code used by all Haflow components.
//!
//! This crate provides:
//! - Catalog database connection pooling (SQLite via sqlx, WAL mode)
//! - Time-series store client (line-protocol writes, windowed queries)
//! - Custom error types
//! - HMAC signature helpers for webhooks
//! - Exponential backoff with full jitter
//! - Component status registry for the read-side API
//! - Structured logging setup

// Module declarations
pub mod backoff;
pub mod db;
pub mod error;
pub mod logging;
pub mod signing;
pub mod status;
pub mod timeseries;

// Re-export commonly used types
pub use backoff::{full_jitter_backoff, is_retryable_status};
pub use db::create_catalog_pool;
pub use error::{Error, Result};
pub use logging::init_tracing;
pub use signing::{sign_hmac, verify_hmac};
pub use status::{ComponentHealth, StatusRegistry};
pub use timeseries::{
    batch_id, FieldValue, HttpTimeSeriesStore, MemoryTimeSeriesStore, Point, TimeSeriesStore,
    WriteError,
};
