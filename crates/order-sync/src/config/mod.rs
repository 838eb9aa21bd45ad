//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use crate::hasher::Hasher;
use crate::sync::{RateLimiter, RetryPolicy};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA-256 of the serialized configuration, logged with every run.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Fingerprint hasher for the configured source layout.
    pub fn hasher(&self) -> Hasher {
        Hasher::new(
            self.source.key_columns.clone(),
            self.source.volatile_columns.iter().cloned(),
        )
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.max_in_flight,
            Duration::from_millis(self.min_interval_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
database:
  host: localhost
  database: orders
  user: sync
  password: hunter2
platform:
  api_token: secret-token
  board_id: "12345"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.state_schema, "order_sync");
        assert_eq!(config.source.table, "orders");
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.max_concurrent_batches, 4);
        assert_eq!(config.archive.retention_days, 90);
        assert!(config.archive.enabled);

        let policy = config.sync.retry_policy();
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert_eq!(
            config.sync.rate_limiter().min_interval(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = Config::from_yaml(MINIMAL).unwrap();
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.sync.batch_size = 10;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let debug_output = format!("{:?}", config);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
        assert!(!debug_output.contains("secret-token"));
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        assert!(Config::from_yaml("database: [").is_err());
    }
}
