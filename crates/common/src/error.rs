//! Error types for Haflow
//!
//! Custom error enum that wraps the failure modes shared across components.
//! Component-local errors (connect failures, write classification) live in
//! their owning crates; this enum covers the cross-cutting infrastructure.

use thiserror::Error;

/// Main error type for Haflow infrastructure operations
#[derive(Debug, Error)]
pub enum Error {
    /// Catalog database errors (SQLite via sqlx)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration errors
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Time-series store errors that are not write classifications
    #[error("time-series store error: {0}")]
    Timeseries(String),

    /// HTTP client errors
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed-batch spool I/O
    #[error("spool error: {0}")]
    Spool(#[from] std::io::Error),

    /// Unreadable spool contents; fatal, the process exits non-zero
    #[error("spool corrupt: {0}")]
    SpoolCorrupt(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
