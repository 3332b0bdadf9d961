//! Configuration module for clearance-sync.

use crate::acs::CcureConfig;
use crate::sync::ReconcilerConfig;
use secrecy::SecretString;
use service_core::config::{self as core_config, env_flag, env_or, env_parse, require_env};
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClearanceSyncConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub ccure: CcureConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Whether the recurring timer is started.
    pub run_scheduler: bool,
    pub interval: Duration,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl SyncConfig {
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            max_concurrency: self.max_concurrency,
            retry: RetryConfig {
                max_retries: self.max_retries,
                initial_backoff: self.initial_backoff,
                max_backoff: self.max_backoff,
                ..RetryConfig::default()
            },
        }
    }

    fn from_env() -> Result<Self, AppError> {
        let interval_secs: u64 = env_parse("SYNC_INTERVAL_SECS", 300)?;
        let max_concurrency: usize = env_parse("SYNC_MAX_CONCURRENCY", 8)?;
        if interval_secs == 0 || max_concurrency == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SYNC_INTERVAL_SECS and SYNC_MAX_CONCURRENCY must be positive"
            )));
        }

        Ok(Self {
            run_scheduler: env_flag("RUN_SCHEDULER", false),
            interval: Duration::from_secs(interval_secs),
            max_concurrency,
            max_retries: env_parse("SYNC_MAX_RETRIES", 3)?,
            initial_backoff: Duration::from_millis(env_parse("SYNC_INITIAL_BACKOFF_MS", 500)?),
            max_backoff: Duration::from_millis(env_parse("SYNC_MAX_BACKOFF_MS", 30_000)?),
        })
    }
}

impl ClearanceSyncConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env_or("SERVICE_NAME", "clearance-sync"),
            log_level: env_or("LOG_LEVEL", "info"),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: require_env("DATABASE_URL")?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            ccure: CcureConfig {
                base_url: env_or("CCURE_BASE_URL", "http://ccure:80"),
                username: env_or("CCURE_USERNAME", ""),
                password: SecretString::new(env_or("CCURE_PASSWORD", "")),
                client_name: env_or("CCURE_CLIENT_NAME", "clearance-sync"),
                client_version: env_or("CCURE_CLIENT_VERSION", env!("CARGO_PKG_VERSION")),
                timeout: Duration::from_secs(env_parse("CCURE_TIMEOUT_SECS", 30)?),
            },
            sync: SyncConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_config_carries_retry_settings() {
        let sync = SyncConfig {
            run_scheduler: true,
            interval: Duration::from_secs(60),
            max_concurrency: 4,
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        };

        let reconciler = sync.reconciler_config();
        assert_eq!(reconciler.max_concurrency, 4);
        assert_eq!(reconciler.retry.max_attempts(), 6);
        assert_eq!(reconciler.retry.max_backoff, Duration::from_millis(100));
    }
}
