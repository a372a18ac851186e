//! Daemon configuration.
//!
//! Everything is set via environment variables:
//! - `CADENCE_STORE` - Optional. Store backend, `sqlite` or `memory`. Defaults to `sqlite`.
//! - `CADENCE_DATA_DIR` - Optional. Directory for the sqlite database. Defaults to `./data`.
//! - `CADENCE_SWEEP_INTERVAL_SECS` - Optional. Seconds between sweep cycles. Defaults to `300`.
//! - `CADENCE_SWEEP_CONCURRENCY` - Optional. Max concurrent firings per sweep. Defaults to `8`.
//! - `CADENCE_CLAIM_LEASE_SECS` - Optional. Lease on an uncommitted firing claim. Defaults to `120`.
//! - `CADENCE_FIRING_TIMEOUT_SECS` - Optional. Per-firing timeout during a sweep. Defaults to `60`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store backend for recurrence definitions and claims
    pub store: StoreKind,

    /// Directory holding the sqlite database file
    pub data_dir: PathBuf,

    /// Cadence of the background sweep
    pub sweep_interval: Duration,

    /// Max firings in flight during one sweep cycle
    pub sweep_concurrency: usize,

    /// How long an uncommitted firing claim blocks other workers
    pub claim_lease: chrono::Duration,

    /// Per-firing timeout during a sweep
    pub firing_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = std::env::var("CADENCE_STORE")
            .map(|raw| StoreKind::parse(&raw))
            .unwrap_or_default();

        let data_dir = std::env::var("CADENCE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let sweep_interval = Duration::from_secs(parse_secs("CADENCE_SWEEP_INTERVAL_SECS", 300)?);

        let sweep_concurrency = std::env::var("CADENCE_SWEEP_CONCURRENCY")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("CADENCE_SWEEP_CONCURRENCY".to_string(), format!("{}", e))
            })?;

        let claim_lease =
            chrono::Duration::seconds(parse_secs("CADENCE_CLAIM_LEASE_SECS", 120)? as i64);

        let firing_timeout = Duration::from_secs(parse_secs("CADENCE_FIRING_TIMEOUT_SECS", 60)?);

        Ok(Self {
            store,
            data_dir,
            sweep_interval,
            sweep_concurrency,
            claim_lease,
            firing_timeout,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            data_dir: PathBuf::from("./data"),
            sweep_interval: Duration::from_secs(300),
            sweep_concurrency: 8,
            claim_lease: chrono::Duration::seconds(120),
            firing_timeout: Duration::from_secs(60),
        }
    }
}

fn parse_secs(var: &str, default: u64) -> Result<u64, ConfigError> {
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|e| ConfigError::InvalidValue(var.to_string(), format!("{}", e)))
}
