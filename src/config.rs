//! Engine settings.
//!
//! ```
//! use hemmer_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{"parallelism": 4}"#).unwrap();
//! assert_eq!(config.parallelism, 4);
//! assert_eq!(config.retry.max_attempts, 5);
//! ```

use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of provider actions running at once.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Options controlling planning and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of actions in flight.
    pub parallelism: usize,
    /// Backoff for transient provider failures.
    pub retry: RetryPolicy,
    /// Re-read every managed instance before planning.
    pub refresh_before_plan: bool,
    /// Name recorded in the state lock while applying.
    pub lock_holder: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
            refresh_before_plan: false,
            lock_holder: "hemmer-engine".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of concurrent actions.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Refresh state from the provider before each plan.
    pub fn with_refresh_before_plan(mut self, refresh: bool) -> Self {
        self.refresh_before_plan = refresh;
        self
    }

    /// Set the lock holder name.
    pub fn with_lock_holder(mut self, holder: impl Into<String>) -> Self {
        self.lock_holder = holder.into();
        self
    }

    /// Parse and validate a configuration from JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents).map_err(|e| match e {
            EngineError::Serialization(err) => {
                EngineError::Config(format!("{}: {}", path.display(), err))
            },
            other => other,
        })
    }

    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(EngineError::Config("parallelism must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }
}
