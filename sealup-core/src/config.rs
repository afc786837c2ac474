//! Upload engine configuration
//!
//! Defaults suit an S3-compatible store; a JSON file and a couple of
//! environment variables can override them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CoreError, Result};

pub const MIB: usize = 1024 * 1024;

/// Exponential backoff for retryable backend errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1 for the first retry)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(retry.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Per-call deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub initiate_ms: u64,
    pub upload_part_ms: u64,
    pub complete_ms: u64,
    pub abort_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            initiate_ms: 10_000,
            upload_part_ms: 120_000,
            complete_ms: 60_000,
            abort_ms: 10_000,
        }
    }
}

impl Timeouts {
    pub fn initiate(&self) -> Duration {
        Duration::from_millis(self.initiate_ms)
    }

    pub fn upload_part(&self) -> Duration {
        Duration::from_millis(self.upload_part_ms)
    }

    pub fn complete(&self) -> Duration {
        Duration::from_millis(self.complete_ms)
    }

    pub fn abort(&self) -> Duration {
        Duration::from_millis(self.abort_ms)
    }
}

/// Upload engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Target part size in bytes; the last part may be shorter
    pub part_size: usize,
    /// Maximum part uploads in flight per upload
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            part_size: 8 * MIB,
            concurrency: 4,
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl UploadConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: UploadConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SEALUP_PART_SIZE` and `SEALUP_CONCURRENCY` overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var("SEALUP_PART_SIZE") {
            self.part_size = v
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid SEALUP_PART_SIZE '{}'", v)))?;
        }
        if let Ok(v) = std::env::var("SEALUP_CONCURRENCY") {
            self.concurrency = v
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid SEALUP_CONCURRENCY '{}'", v)))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(CoreError::Config("part_size must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(CoreError::Config("concurrency must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.part_size, 8 * MIB);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.timeouts.upload_part(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(5_000));
    }

    #[test]
    fn test_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"concurrency": 8, "retry": {{"max_attempts": 5}}}}"#).unwrap();

        let config = UploadConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.part_size, 8 * MIB);
    }

    #[test]
    fn test_validation() {
        let config = UploadConfig {
            concurrency: 0,
            ..UploadConfig::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let config = UploadConfig {
            retry: RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            },
            ..UploadConfig::default()
        };
        assert!(config.validate().is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"part_size": 0}}"#).unwrap();
        assert!(UploadConfig::from_json_file(file.path()).is_err());
    }
}
