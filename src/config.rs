//! Operator configuration loaded from environment variables

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Runtime settings for the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Port of the metrics/health HTTP server
    pub metrics_port: u16,
    /// Requeue delay after a retry signal
    pub reconcile_interval: Duration,
    /// First error backoff delay; doubled on each consecutive failure
    pub backoff_base: Duration,
    /// Upper bound for the error backoff delay
    pub backoff_max: Duration,
    /// ServiceAccount the backup CronJobs run as
    pub worker_service_account: String,
    /// Image run by backup CronJobs
    pub worker_image: String,
    /// Field manager sent with every write
    pub field_manager: String,
    /// Number of BackupSchedules reconciled concurrently
    pub concurrency: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: 8080,
            reconcile_interval: Duration::from_secs(10),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            worker_service_account: "dataprotection-worker".to_string(),
            worker_image: "ghcr.io/dbops/dataprotection-worker:latest".to_string(),
            field_manager: "dataprotection-operator".to_string(),
            concurrency: 4,
        }
    }
}

impl OperatorConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup; unset or blank variables keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(port) = parse_var::<u16>("METRICS_PORT", var("METRICS_PORT"))? {
            config.metrics_port = port;
        }
        if let Some(secs) = parse_var::<u64>("RECONCILE_INTERVAL_SECS", var("RECONCILE_INTERVAL_SECS"))? {
            config.reconcile_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("BACKOFF_BASE_SECS", var("BACKOFF_BASE_SECS"))? {
            config.backoff_base = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("BACKOFF_MAX_SECS", var("BACKOFF_MAX_SECS"))? {
            config.backoff_max = Duration::from_secs(secs);
        }
        if let Some(concurrency) = parse_var::<u16>("CONTROLLER_CONCURRENCY", var("CONTROLLER_CONCURRENCY"))? {
            config.concurrency = concurrency;
        }
        if let Some(account) = var("WORKER_SERVICE_ACCOUNT") {
            config.worker_service_account = account;
        }
        if let Some(image) = var("WORKER_IMAGE") {
            config.worker_image = image;
        }
        if let Some(manager) = var("FIELD_MANAGER") {
            config.field_manager = manager;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.reconcile_interval.is_zero() {
            return Err(Error::config("RECONCILE_INTERVAL_SECS must be greater than 0"));
        }
        if self.backoff_base.is_zero() {
            return Err(Error::config("BACKOFF_BASE_SECS must be greater than 0"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::config(
                "BACKOFF_MAX_SECS must not be smaller than BACKOFF_BASE_SECS",
            ));
        }
        if self.concurrency == 0 {
            return Err(Error::config("CONTROLLER_CONCURRENCY must be greater than 0"));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = value else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::config(format!("{name}={value} is invalid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<OperatorConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.field_manager, "dataprotection-operator");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("METRICS_PORT", "9090"),
            ("RECONCILE_INTERVAL_SECS", " 30 "),
            ("WORKER_SERVICE_ACCOUNT", "backup-runner"),
            ("FIELD_MANAGER", ""),
        ])
        .unwrap();
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.worker_service_account, "backup-runner");
        assert_eq!(config.field_manager, "dataprotection-operator");
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let err = load(&[("METRICS_PORT", "http")]).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("METRICS_PORT")));

        let err = load(&[("BACKOFF_BASE_SECS", "60"), ("BACKOFF_MAX_SECS", "30")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        assert!(load(&[("CONTROLLER_CONCURRENCY", "0")]).is_err());
    }
}
