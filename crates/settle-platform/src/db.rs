use std::time::Duration;

use anyhow::{Context, Result};
use settle_core::SettlementError;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

pub async fn connect_database(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("applying settlement ledger migrations");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("settlement ledger migration failed")?;
    Ok(())
}

/// Lock timeouts, deadlocks and serialization failures are retryable
/// conflicts. Everything else is a storage fault.
pub fn db_error(err: sqlx::Error) -> SettlementError {
    if let sqlx::Error::Database(ref db_err) = err
        && let Some(code) = db_err.code()
        && matches!(code.as_ref(), "40P01" | "55P03" | "40001")
    {
        return SettlementError::StorageConflict(db_err.message().to_string());
    }
    if let sqlx::Error::PoolTimedOut = err {
        return SettlementError::StorageConflict("timed out acquiring a connection".to_string());
    }
    SettlementError::Storage(anyhow::Error::new(err))
}
