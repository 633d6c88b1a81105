//! Engine-wide constants
//!
//! Single source of truth for defaults used by [`crate::config::EngineConfig`]
//! and the built-in middleware.

/// Default values for engine configuration
pub mod defaults {
    use std::time::Duration;

    /// Maximum number of nodes dispatched in one batch
    pub const MAX_CONCURRENCY: usize = 3;
    /// How long a successful result stays in the cache
    pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
    /// Maximum number of cached results before LRU eviction
    pub const CACHE_CAPACITY: usize = 1024;
    /// Additional attempts after the first failure
    pub const MAX_RETRIES: u32 = 3;
    /// Backoff before the first retry; doubles each attempt
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);
    /// Per-attempt budget for AI model nodes
    pub const AI_NODE_TIMEOUT: Duration = Duration::from_secs(30);
    /// Per-attempt budget for data processing nodes
    pub const PROCESSING_NODE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Per-attempt budget for every other node kind
    pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);
    /// Budget for a whole workflow run
    pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    /// Snapshots not refreshed for this long are swept
    pub const STATE_STALE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
}

/// Well-known keys in a node's processing inputs
pub mod input_keys {
    /// The node's own configuration payload
    pub const NODE_DATA: &str = "nodeData";
}
