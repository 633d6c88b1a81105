//! Engine configuration
//!
//! All knobs have defaults from [`crate::constants::defaults`]; a host can
//! override any subset from JSON. Durations are expressed in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::defaults;
use crate::error::{NodeEngineError, Result};
use crate::types::NodeKind;

/// What the scheduler does once a node fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Skip the failed node's dependents and keep running independent branches
    #[default]
    Continue,
    /// Stop dispatching after the batch containing the first failure
    FailFast,
}

/// Caching middleware settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    #[serde(rename = "ttlMs", with = "duration_ms")]
    pub ttl: Duration,
    /// Maximum entries before least-recently-used eviction
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: defaults::CACHE_TTL,
            capacity: defaults::CACHE_CAPACITY,
        }
    }
}

/// Retry middleware settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    #[serde(rename = "baseDelayMs", with = "duration_ms")]
    pub base_delay: Duration,
}

impl RetryConfig {
    /// Backoff before retrying after attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            base_delay: defaults::RETRY_BASE_DELAY,
        }
    }
}

/// Per-attempt time budget by node kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeTimeouts {
    #[serde(rename = "aiModelMs", with = "duration_ms")]
    pub ai_model: Duration,
    #[serde(rename = "processingMs", with = "duration_ms")]
    pub processing: Duration,
    #[serde(rename = "defaultMs", with = "duration_ms")]
    pub default: Duration,
}

impl NodeTimeouts {
    pub fn for_kind(&self, kind: NodeKind) -> Duration {
        match kind {
            NodeKind::AiModel => self.ai_model,
            NodeKind::Processing | NodeKind::AdvancedProcessing => self.processing,
            NodeKind::Input | NodeKind::Output => self.default,
        }
    }
}

impl Default for NodeTimeouts {
    fn default() -> Self {
        Self {
            ai_model: defaults::AI_NODE_TIMEOUT,
            processing: defaults::PROCESSING_NODE_TIMEOUT,
            default: defaults::DEFAULT_NODE_TIMEOUT,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Maximum nodes dispatched together in one batch
    pub max_concurrency: usize,
    pub failure_policy: FailurePolicy,
    #[serde(rename = "executionTimeoutMs", with = "duration_ms")]
    pub execution_timeout: Duration,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub timeouts: NodeTimeouts,
    #[serde(rename = "stateStaleTimeoutMs", with = "duration_ms")]
    pub state_stale_timeout: Duration,
}

impl EngineConfig {
    /// Parse and validate a configuration from JSON; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(NodeEngineError::InvalidConfig(
                "maxConcurrency must be at least 1".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(NodeEngineError::InvalidConfig(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: defaults::MAX_CONCURRENCY,
            failure_policy: FailurePolicy::default(),
            execution_timeout: defaults::EXECUTION_TIMEOUT,
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            timeouts: NodeTimeouts::default(),
            state_stale_timeout: defaults::STATE_STALE_TIMEOUT,
        }
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = EngineConfig::from_json(
            r#"{
                "maxConcurrency": 8,
                "failurePolicy": "failFast",
                "cache": {"ttlMs": 1000},
                "retry": {"baseDelayMs": 50}
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.cache.ttl, Duration::from_secs(1));
        assert_eq!(config.cache.capacity, defaults::CACHE_CAPACITY);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_retries, defaults::MAX_RETRIES);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = EngineConfig::from_json(r#"{"maxConcurrency": 0}"#).unwrap_err();
        assert!(matches!(err, NodeEngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(0), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(1), Duration::from_millis(2000));
        assert_eq!(retry.delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_timeouts_by_kind() {
        let timeouts = NodeTimeouts::default();
        assert_eq!(timeouts.for_kind(NodeKind::AiModel), Duration::from_secs(30));
        assert_eq!(timeouts.for_kind(NodeKind::Processing), Duration::from_secs(10));
        assert_eq!(timeouts.for_kind(NodeKind::Output), Duration::from_secs(30));
    }
}
