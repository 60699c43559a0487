//! Process configuration.
//!
//! Everything is read from environment variables (after `.env` has been
//! loaded by `dotenvy`), each with a default suitable for a single-machine
//! install.

use std::time::Duration;

use crate::api::server::ApiServerConfig;
use crate::pipeline::{SweeperConfig, WorkerPoolConfig};
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:stinercut.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub api: ApiServerConfig,
    pub workers: WorkerPoolConfig,
    /// How often idle workers re-check the queue without a wakeup.
    pub poll_interval: Duration,
    pub sweeper: SweeperConfig,
    pub log_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            api: ApiServerConfig::default(),
            workers: WorkerPoolConfig::default(),
            poll_interval: crate::pipeline::DEFAULT_POLL_INTERVAL,
            sweeper: SweeperConfig::default(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    ///
    /// Supported env vars:
    /// - `DATABASE_URL`
    /// - `API_BIND_ADDRESS`, `API_PORT`
    /// - `PIPELINE_WORKERS`, `PIPELINE_POLL_INTERVAL_MS`
    /// - `PIPELINE_LEASE_SECS`, `PIPELINE_HEARTBEAT_SECS`
    /// - `PIPELINE_SWEEP_INTERVAL_SECS`, `PIPELINE_STALE_AFTER_SECS`
    /// - `LOG_DIR`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = value("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(bind_address) = value("API_BIND_ADDRESS") {
            config.api.bind_address = bind_address;
        }
        if let Some(port) = value("API_PORT") {
            config.api.port = parse_number("API_PORT", &port)?;
        }
        if let Some(workers) = value("PIPELINE_WORKERS") {
            config.workers.workers = parse_number("PIPELINE_WORKERS", &workers)?;
        }
        if let Some(poll) = value("PIPELINE_POLL_INTERVAL_MS") {
            config.poll_interval =
                Duration::from_millis(parse_number("PIPELINE_POLL_INTERVAL_MS", &poll)?);
        }
        if let Some(lease) = value("PIPELINE_LEASE_SECS") {
            config.workers.lease_secs = parse_number("PIPELINE_LEASE_SECS", &lease)?;
        }
        if let Some(heartbeat) = value("PIPELINE_HEARTBEAT_SECS") {
            config.workers.heartbeat_secs = parse_number("PIPELINE_HEARTBEAT_SECS", &heartbeat)?;
        }
        if let Some(interval) = value("PIPELINE_SWEEP_INTERVAL_SECS") {
            config.sweeper.interval =
                Duration::from_secs(parse_number("PIPELINE_SWEEP_INTERVAL_SECS", &interval)?);
        }
        if let Some(stale) = value("PIPELINE_STALE_AFTER_SECS") {
            config.sweeper.stale_after =
                Duration::from_secs(parse_number("PIPELINE_STALE_AFTER_SECS", &stale)?);
        }
        if let Some(log_dir) = value("LOG_DIR") {
            config.log_dir = log_dir;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.workers == 0 {
            return Err(Error::config("PIPELINE_WORKERS must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("PIPELINE_POLL_INTERVAL_MS must be positive"));
        }
        if self.workers.heartbeat_secs >= self.workers.lease_secs {
            return Err(Error::config(format!(
                "PIPELINE_HEARTBEAT_SECS ({}) must be shorter than PIPELINE_LEASE_SECS ({})",
                self.workers.heartbeat_secs, self.workers.lease_secs
            )));
        }
        if self.sweeper.interval.is_zero() {
            return Err(Error::config("PIPELINE_SWEEP_INTERVAL_SECS must be positive"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| Error::config(format!("{} has invalid value '{}': {}", key, raw, e)))
}
