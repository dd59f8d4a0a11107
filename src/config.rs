use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Scheduler configuration, loaded from environment variables.
///
/// Mirrors spec §6's configuration fields: `enabled`, `lock_ttl`,
/// `heartbeat_interval`, `cleanup_interval`, `version`, plus `drain_timeout`
/// for the graceful-shutdown window.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// When false, the scheduler runs tasks locally without contesting a
    /// distributed lock or touching the instance registry.
    pub enabled: bool,
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    pub drain_timeout: Duration,
    pub version: String,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for every tunable but `REDIS_URL`.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            enabled: env::var("CRON_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            lock_ttl: Duration::from_secs(
                env::var("CRON_LOCK_TTL_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("CRON_LOCK_TTL_SECS must be a valid number")?,
            ),
            heartbeat_interval: Duration::from_secs(
                env::var("CRON_HEARTBEAT_INTERVAL_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .context("CRON_HEARTBEAT_INTERVAL_SECS must be a valid number")?,
            ),
            cleanup_interval: Duration::from_secs(
                env::var("CRON_CLEANUP_INTERVAL_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .context("CRON_CLEANUP_INTERVAL_SECS must be a valid number")?,
            ),
            drain_timeout: Duration::from_secs(
                env::var("CRON_DRAIN_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .context("CRON_DRAIN_TIMEOUT_SECS must be a valid number")?,
            ),
            version: env::var("CRON_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env_vars() {
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("CRON_ENABLED");
        let config = Config::from_env().expect("defaults must load without required vars");
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert!(config.enabled);
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn cron_enabled_false_disables_distributed_mode() {
        std::env::set_var("CRON_ENABLED", "false");
        let config = Config::from_env().unwrap();
        assert!(!config.enabled);
        std::env::remove_var("CRON_ENABLED");
    }
}
