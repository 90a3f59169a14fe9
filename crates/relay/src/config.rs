//! Relay configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use relaykit_core::{error::validate_table_name, BackoffPolicy, ValidationError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Tunables for one relay (one outbox table).
///
/// Every field has a production-reasonable default; deployments override
/// via `OUTBOX_*` environment variables or by mutating the struct before
/// startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Outbox table this relay scans.
    pub table: String,
    /// Number of physical shards; the sweep scans `0..shard_count`.
    pub shard_count: i32,
    /// Claim batch size per shard per sweep.
    pub batch_size_per_shard: u32,
    /// Processing lease; an instance that does not finish (or renew)
    /// within this window loses the record to recovery.
    pub lease_seconds: i64,
    /// Failures before a record goes to the dead-letter state.
    pub max_retry_count: i32,
    /// Ceiling on the exponential retry delay.
    pub backoff_cap_secs: i64,
    /// Age at which `SENT` records are deleted.
    pub sent_retention_days: i64,
    /// Age at which `DEAD` records are deleted.
    pub dead_retention_days: i64,
    /// How often the recovery task resets expired leases.
    pub recovery_interval_ms: u64,
    /// Fallback polling sweep period; kicks cover the common case.
    pub sweep_interval_ms: u64,
    /// How often retention cleanup runs.
    pub cleanup_interval_secs: u64,
    /// Shards deleted per cleanup statement, bounding transaction size.
    pub cleanup_shard_batch: i32,
    /// Capacity of the in-process kick channel.
    pub kick_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            table: "outbox".to_string(),
            shard_count: 3,
            batch_size_per_shard: 50,
            lease_seconds: 30,
            max_retry_count: 20,
            backoff_cap_secs: 300,
            sent_retention_days: 7,
            dead_retention_days: 90,
            recovery_interval_ms: 10_000,
            sweep_interval_ms: 60_000,
            cleanup_interval_secs: 86_400,
            cleanup_shard_batch: 32,
            kick_buffer: 256,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by any `OUTBOX_*` variables present in the
    /// environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(table) = std::env::var("OUTBOX_TABLE") {
            config.table = table;
        }
        read_env("OUTBOX_SHARD_COUNT", &mut config.shard_count)?;
        read_env("OUTBOX_BATCH_SIZE", &mut config.batch_size_per_shard)?;
        read_env("OUTBOX_LEASE_SECONDS", &mut config.lease_seconds)?;
        read_env("OUTBOX_MAX_RETRY_COUNT", &mut config.max_retry_count)?;
        read_env("OUTBOX_BACKOFF_CAP_SECS", &mut config.backoff_cap_secs)?;
        read_env("OUTBOX_SENT_RETENTION_DAYS", &mut config.sent_retention_days)?;
        read_env("OUTBOX_DEAD_RETENTION_DAYS", &mut config.dead_retention_days)?;
        read_env("OUTBOX_RECOVERY_INTERVAL_MS", &mut config.recovery_interval_ms)?;
        read_env("OUTBOX_SWEEP_INTERVAL_MS", &mut config.sweep_interval_ms)?;
        read_env("OUTBOX_CLEANUP_INTERVAL_SECS", &mut config.cleanup_interval_secs)?;
        read_env("OUTBOX_CLEANUP_SHARD_BATCH", &mut config.cleanup_shard_batch)?;
        read_env("OUTBOX_KICK_BUFFER", &mut config.kick_buffer)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_table_name(&self.table)?;

        let positive: [(&'static str, i64); 6] = [
            ("shard_count", self.shard_count as i64),
            ("batch_size_per_shard", self.batch_size_per_shard as i64),
            ("lease_seconds", self.lease_seconds),
            ("backoff_cap_secs", self.backoff_cap_secs),
            ("cleanup_shard_batch", self.cleanup_shard_batch as i64),
            ("kick_buffer", self.kick_buffer as i64),
        ];
        for (key, value) in positive {
            if value < 1 {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("must be >= 1, got {value}"),
                });
            }
        }
        let non_negative: [(&'static str, i64); 3] = [
            ("max_retry_count", self.max_retry_count as i64),
            ("sent_retention_days", self.sent_retention_days),
            ("dead_retention_days", self.dead_retention_days),
        ];
        for (key, value) in non_negative {
            if value < 0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("must be >= 0, got {value}"),
                });
            }
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_retry_count, self.backoff_cap_secs)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds)
    }
}

fn read_env<T>(key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *target = raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.shard_count = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.table = "outbox; drop".to_string();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.max_retry_count = -1;
        assert!(config.validate().is_err());

        // Negative retention would put cleanup cutoffs in the future.
        let mut config = RelayConfig::default();
        config.sent_retention_days = -1;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.dead_retention_days = -7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn policy_reflects_config() {
        let mut config = RelayConfig::default();
        config.max_retry_count = 5;
        config.backoff_cap_secs = 60;
        let policy = config.backoff_policy();
        assert!(policy.is_exhausted(5));
        assert_eq!(policy.delay_for(10), chrono::Duration::seconds(60));
    }
}
