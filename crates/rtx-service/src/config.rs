use std::path::Path;
use std::thread;
use std::time::Duration;

use rand::Rng;
use rtx_types::NodeId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};

/// How to retry an operation that failed with a lock conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds. Attempt `n` waits `n * backoff_ms` plus
    /// up to `backoff_ms` of random jitter.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 10,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.backoff_ms > 0 {
            rand::thread_rng().gen_range(0..self.backoff_ms)
        } else {
            0
        };
        Duration::from_millis(self.backoff_ms * u64::from(attempt) + jitter)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts.
    pub fn run<T>(&self, mut operation: impl FnMut() -> ServiceResult<T>) -> ServiceResult<T> {
        let mut attempt = 1;
        loop {
            match operation() {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Configuration for the resource service and scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// The node on whose behalf every transaction runs. Paths without a
    /// context are scoped to this node.
    pub node_id: NodeId,
    pub conflict_retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::random(),
            conflict_retry: RetryPolicy::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(source: &str) -> ServiceResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ServiceResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn to_toml_string(&self) -> ServiceResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServiceError::Config(e.to_string()))
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.conflict_retry.max_attempts == 0 {
            return Err(ServiceError::Config(
                "conflict_retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
