//! Process configuration from environment variables.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use regsync_outbox::RetryPolicy;

use crate::dispatcher::DispatcherConfig;
use crate::receipts::PollerConfig;
use crate::vault::{CredentialVault, VaultError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required variable {var}")]
    Missing { var: &'static str },
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("credential keys: {0}")]
    Keys(#[from] VaultError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(ConfigError::Invalid {
                var: "REGSYNC_LOG_FORMAT",
                reason: format!("expected json or pretty, got {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Absent: in-memory stores.
    pub database_url: Option<String>,
    pub registry_base_url: String,
    pub bind_addr: SocketAddr,
    pub workers: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub lease_ttl: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub receipt_poll_interval: Duration,
    pub receipt_window: Duration,
    pub drift_interval: Duration,
    /// `version:base64key,...`
    pub credential_keys: String,
    pub alert_webhook_url: Option<String>,
    pub log_format: LogFormat,
}

impl SyncConfig {
    /// Load from the process environment.
    ///
    /// Required: `REGISTRY_BASE_URL`, `REGSYNC_CREDENTIAL_KEYS`. Everything
    /// else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let required = |var: &'static str| get(var).ok_or(ConfigError::Missing { var });

        let bind_addr = match get("REGSYNC_BIND_ADDR") {
            Some(v) => v.parse().map_err(|e| ConfigError::Invalid {
                var: "REGSYNC_BIND_ADDR",
                reason: format!("{e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };
        let log_format = match get("REGSYNC_LOG_FORMAT") {
            Some(v) => v.parse()?,
            None => LogFormat::Pretty,
        };

        let config = Self {
            database_url: get("DATABASE_URL"),
            registry_base_url: required("REGISTRY_BASE_URL")?,
            bind_addr,
            workers: number(&get, "REGSYNC_WORKERS", 4)?,
            batch_size: number(&get, "REGSYNC_BATCH_SIZE", 32)?,
            poll_interval: Duration::from_millis(number(&get, "REGSYNC_POLL_INTERVAL_MS", 500)?),
            call_timeout: Duration::from_secs(number(&get, "REGSYNC_CALL_TIMEOUT_SECS", 30)?),
            lease_ttl: Duration::from_secs(number(&get, "REGSYNC_LEASE_TTL_SECS", 120)?),
            max_attempts: number(&get, "REGSYNC_MAX_ATTEMPTS", 8)?,
            backoff_base: Duration::from_millis(number(&get, "REGSYNC_BACKOFF_BASE_MS", 1000)?),
            backoff_max: Duration::from_secs(number(&get, "REGSYNC_BACKOFF_MAX_SECS", 900)?),
            receipt_poll_interval: Duration::from_secs(number(&get, "REGSYNC_RECEIPT_POLL_SECS", 60)?),
            receipt_window: Duration::from_secs(
                number::<u64>(&get, "REGSYNC_RECEIPT_WINDOW_HOURS", 72)? * 3600,
            ),
            drift_interval: Duration::from_secs(number(&get, "REGSYNC_DRIFT_INTERVAL_SECS", 21_600)?),
            credential_keys: required("REGSYNC_CREDENTIAL_KEYS")?,
            alert_webhook_url: get("REGSYNC_ALERT_WEBHOOK_URL"),
            log_format,
        };

        if config.workers == 0 {
            return Err(ConfigError::Invalid { var: "REGSYNC_WORKERS", reason: "must be at least 1".into() });
        }
        if config.max_attempts == 0 {
            return Err(ConfigError::Invalid { var: "REGSYNC_MAX_ATTEMPTS", reason: "must be at least 1".into() });
        }
        if config.backoff_max < config.backoff_base {
            return Err(ConfigError::Invalid {
                var: "REGSYNC_BACKOFF_MAX_SECS",
                reason: "must not be below the base delay".into(),
            });
        }
        // A lease renewed before each send must outlive the call it covers.
        if config.lease_ttl <= config.call_timeout {
            return Err(ConfigError::Invalid {
                var: "REGSYNC_LEASE_TTL_SECS",
                reason: "must exceed REGSYNC_CALL_TIMEOUT_SECS".into(),
            });
        }
        Ok(config)
    }

    pub fn vault(&self) -> Result<CredentialVault, ConfigError> {
        Ok(CredentialVault::from_key_list(&self.credential_keys)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.backoff_base, self.backoff_max)
    }

    pub fn dispatcher(&self, holder: impl Into<String>) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            call_timeout: self.call_timeout,
            lease_ttl: chrono_duration(self.lease_ttl),
            retry: self.retry_policy(),
            holder: holder.into(),
        }
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            batch_size: self.batch_size,
            receipt_window: chrono_duration(self.receipt_window),
        }
    }

    pub fn receipt_poll_interval(&self) -> chrono::Duration {
        chrono_duration(self.receipt_poll_interval)
    }
}

fn number<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: format!("{v:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("REGISTRY_BASE_URL", "https://registry.example"),
        ("REGSYNC_CREDENTIAL_KEYS", "1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
    ];

    #[test]
    fn defaults_apply() {
        let config = SyncConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.database_url, None);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.receipt_window, Duration::from_secs(72 * 3600));
        assert_eq!(config.drift_interval, Duration::from_secs(21_600));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.dispatcher("node-1").lease_ttl, chrono::Duration::seconds(120));
        assert!(config.vault().is_ok());
    }

    #[test]
    fn invalid_values_are_errors() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("REGSYNC_WORKERS", "many"));
        let err = SyncConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "REGSYNC_WORKERS", .. }));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("REGSYNC_LOG_FORMAT", "xml"));
        assert!(SyncConfig::from_lookup(lookup(&pairs)).is_err());
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("REGSYNC_CALL_TIMEOUT_SECS", "60"));
        pairs.push(("REGSYNC_LEASE_TTL_SECS", "45"));
        let err = SyncConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "REGSYNC_LEASE_TTL_SECS", .. }));
    }

    #[test]
    fn missing_registry_url_is_reported() {
        let err = SyncConfig::from_lookup(lookup(&REQUIRED[1..])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { var: "REGISTRY_BASE_URL" }));
    }
}
