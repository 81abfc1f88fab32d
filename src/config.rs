//! Controller configuration.

use std::time::Duration;

/// How often the reconciler jobs sweep each tenant. Fixed cadence; the timer
/// does not try to catch up after a slow tick.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Backoff applied to a group-key run before the reconciler retries it.
pub const REQUEUE_BACKOFF: Duration = Duration::from_secs(5);

/// Initial schedule timeout for a group-key run.
pub const DEFAULT_STEP_RUN_TIMEOUT: &str = "60s";

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Schedule timeout for group-key resolution
    pub default_step_run_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("FLOWGATE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| anyhow::anyhow!("FLOWGATE_DATABASE_URL must be set"))?;

        let default_step_run_timeout = std::env::var("FLOWGATE_DEFAULT_STEP_RUN_TIMEOUT")
            .unwrap_or_else(|_| DEFAULT_STEP_RUN_TIMEOUT.to_string());
        let default_step_run_timeout = humantime::parse_duration(&default_step_run_timeout)
            .map_err(|err| anyhow::anyhow!("invalid FLOWGATE_DEFAULT_STEP_RUN_TIMEOUT: {err}"))?;

        Ok(Config {
            database_url,
            default_step_run_timeout,
        })
    }
}
