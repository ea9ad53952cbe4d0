//! Configuration management for the stock ledger
//!
//! Supports hierarchical configuration loading:
//! 1. Default values in code
//! 2. Configuration files (config/development.toml, config/production.toml)
//! 3. Environment variable overrides with LEDGER_ prefix

use std::time::Duration;

use config::{ConfigError, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Current environment (development, production)
    pub environment: String,

    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Ledger behaviour
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server port
    pub port: u16,

    /// Server host
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    pub acquire_timeout_secs: u64,

    /// Apply migrations at startup
    pub run_migrations: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    /// Lifetime of a held reservation before it expires
    pub reservation_ttl_secs: u64,

    /// Longest wait for a contended balance lock
    pub lock_timeout_ms: u64,

    /// Rows per page when listing or streaming history
    pub history_page_size: u32,

    /// Period of the reservation expiry sweep
    pub sweep_interval_secs: u64,

    /// Reservations expired per sweep pass
    pub sweep_batch_size: u32,
}

impl LedgerConfig {
    pub fn reservation_ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.reservation_ttl_secs).unwrap_or(i64::MAX);
        chrono::Duration::seconds(secs.min(i64::MAX / 1_000))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 900,
            lock_timeout_ms: 2000,
            history_page_size: 200,
            sweep_interval_secs: 30,
            sweep_batch_size: 500,
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("LEDGER_ENVIRONMENT").unwrap_or_else(|_| "development".into());
        let defaults = LedgerConfig::default();

        let config = config::Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.run_migrations", environment == "development")?
            .set_default("ledger.reservation_ttl_secs", defaults.reservation_ttl_secs as i64)?
            .set_default("ledger.lock_timeout_ms", defaults.lock_timeout_ms as i64)?
            .set_default("ledger.history_page_size", i64::from(defaults.history_page_size))?
            .set_default("ledger.sweep_interval_secs", defaults.sweep_interval_secs as i64)?
            .set_default("ledger.sweep_batch_size", i64::from(defaults.sweep_batch_size))?
            // Load environment-specific config file
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Override with environment variables (LEDGER_ prefix)
            .add_source(
                Environment::with_prefix("LEDGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_defaults() {
        let ledger = LedgerConfig::default();
        assert_eq!(ledger.reservation_ttl(), chrono::Duration::minutes(15));
        assert_eq!(ledger.lock_timeout(), Duration::from_secs(2));
        assert_eq!(ledger.history_page_size, 200);
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        let ledger = LedgerConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(ledger.sweep_interval(), Duration::from_secs(1));
    }
}
