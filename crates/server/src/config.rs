//! Runtime configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use bank_observability::LogFormat;
use bank_worker::QueueConfig;

pub const DEFAULT_VERIFY_EMAIL_URL: &str = "http://localhost:8080/verify_email";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Attempts per retried ledger transaction.
    pub tx_max_attempts: u32,
    pub worker_concurrency: usize,
    pub task_poll_interval: Duration,
    /// How long a claimed task is reserved before it counts as orphaned.
    pub task_lease: Duration,
    pub task_queues: QueueConfig,
    pub verify_email_url: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through `lookup`, which returns the raw value of a
    /// variable or `None` when it is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let db_max_connections = parse_or(get("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS", 10)?;
        let tx_max_attempts = parse_or(get("TX_MAX_ATTEMPTS"), "TX_MAX_ATTEMPTS", 3)?;
        let worker_concurrency = parse_or(get("WORKER_CONCURRENCY"), "WORKER_CONCURRENCY", 4)?;
        let poll_ms: u64 = parse_or(get("TASK_POLL_INTERVAL_MS"), "TASK_POLL_INTERVAL_MS", 100)?;
        let lease_secs: u64 = parse_or(get("TASK_LEASE_SECS"), "TASK_LEASE_SECS", 300)?;
        let queues = parse_or(get("TASK_QUEUES"), "TASK_QUEUES", QueueConfig::default())?;
        let strict = parse_or(get("TASK_STRICT_PRIORITY"), "TASK_STRICT_PRIORITY", false)?;
        let log_format = parse_or(get("LOG_FORMAT"), "LOG_FORMAT", LogFormat::Json)?;

        for (var, n) in [
            ("DB_MAX_CONNECTIONS", db_max_connections as usize),
            ("TX_MAX_ATTEMPTS", tx_max_attempts as usize),
            ("WORKER_CONCURRENCY", worker_concurrency),
            ("TASK_LEASE_SECS", lease_secs as usize),
        ] {
            if n == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        Ok(Self {
            database_url,
            db_max_connections,
            tx_max_attempts,
            worker_concurrency,
            task_poll_interval: Duration::from_millis(poll_ms),
            task_lease: Duration::from_secs(lease_secs),
            task_queues: queues.strict(strict),
            verify_email_url: get("VERIFY_EMAIL_URL")
                .unwrap_or_else(|| DEFAULT_VERIFY_EMAIL_URL.to_string()),
            log_format,
        })
    }
}

fn parse_or<T>(raw: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
