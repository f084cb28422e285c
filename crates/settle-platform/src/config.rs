use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub http_addr: String,
    pub max_connections: u32,
    /// Size of the separate pool used by the stock catalog.
    pub catalog_max_connections: u32,
    pub lock_timeout: Duration,
    /// `None` when the background overdue sweep is disabled.
    pub overdue_sweep_interval: Option<Duration>,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());
        let max_connections = env_number("DB_MAX_CONNECTIONS", 10)?;
        if max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be at least 1");
        }
        let catalog_max_connections = env_number("CATALOG_DB_MAX_CONNECTIONS", 4)?;
        if catalog_max_connections == 0 {
            anyhow::bail!("CATALOG_DB_MAX_CONNECTIONS must be at least 1");
        }
        let lock_timeout_ms = env_number("SETTLEMENT_LOCK_TIMEOUT_MS", 5_000)?;
        if lock_timeout_ms == 0 {
            anyhow::bail!("SETTLEMENT_LOCK_TIMEOUT_MS must be at least 1");
        }
        let sweep_secs = env_number("OVERDUE_SWEEP_INTERVAL_SECS", 3_600)?;

        Ok(Self {
            database_url,
            http_addr,
            max_connections: u32::try_from(max_connections)
                .context("DB_MAX_CONNECTIONS is out of range")?,
            catalog_max_connections: u32::try_from(catalog_max_connections)
                .context("CATALOG_DB_MAX_CONNECTIONS is out of range")?,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            overdue_sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        })
    }
}

fn env_number(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{name} must be a non-negative integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
