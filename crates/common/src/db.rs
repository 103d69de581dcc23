//! Catalog database connection pool management
//!
//! SQLite via sqlx with WAL journaling and a busy timeout, so the single
//! writer (the registry discoverer) never blocks concurrent readers and
//! readers get snapshot-consistent views.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::Result;

/// Create the catalog connection pool
///
/// `database_url` accepts the usual sqlx forms, e.g. `sqlite://haflow.db` or
/// `sqlite::memory:` for tests. The database file is created if missing.
pub async fn create_catalog_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    info!(max_connections, "creating catalog pool");

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    health_check(&pool).await?;

    Ok(pool)
}

/// Check that the catalog database answers queries
pub async fn health_check(pool: &SqlitePool) -> Result<()> {
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;

    if row.0 == 1 {
        Ok(())
    } else {
        Err(crate::error::Error::Database(sqlx::Error::Protocol(
            "health check failed".into(),
        )))
    }
}

/// Pool statistics for monitoring: (size, idle)
pub fn pool_stats(pool: &SqlitePool) -> (u32, usize) {
    (pool.size(), pool.num_idle())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool() {
        let pool = create_catalog_pool("sqlite::memory:", 2).await.unwrap();
        health_check(&pool).await.unwrap();

        let (size, idle) = pool_stats(&pool);
        assert!(size > 0);
        assert!(idle <= size as usize);
    }
}
