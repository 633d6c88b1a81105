//! Result memoization keyed by input fingerprint
//!
//! The fingerprint is the node id plus a SHA-256 over the sorted inputs.
//! Only successful results are stored. Entries expire after the TTL and the
//! store is bounded: once full, expired entries go first, then the least
//! recently used one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::{Middleware, Next};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::processor::{ProcessingContext, ProcessingResult};

struct CacheEntry {
    result: ProcessingResult,
    stored_at: Instant,
    last_used: Instant,
}

/// Caching middleware
///
/// One instance is shared by every pipeline that should see the same cache.
pub struct CachingMiddleware {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CachingMiddleware {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl, config.capacity)
    }

    /// Cache key for an invocation: `<nodeId>-<sha256 of sorted inputs>`
    pub fn fingerprint(ctx: &ProcessingContext) -> String {
        let canonical = serde_json::to_vec(&ctx.inputs.sorted()).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}-{}", ctx.node_id, hex)
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.stored_at) < self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    fn lookup(&self, key: &str) -> Option<ProcessingResult> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            None => return None,
            Some(entry) if now.duration_since(entry.stored_at) >= self.ttl => true,
            Some(entry) => {
                entry.last_used = now;
                return Some(entry.result.clone());
            }
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    fn store(&self, key: String, result: ProcessingResult) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            entries.retain(|_, entry| now.duration_since(entry.stored_at) < self.ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    log::debug!("Cache full, evicting '{}'", oldest);
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: now,
                last_used: now,
            },
        );
    }
}

#[async_trait]
impl Middleware for CachingMiddleware {
    fn name(&self) -> &str {
        "caching"
    }

    async fn execute(&self, ctx: &ProcessingContext, next: Next<'_>) -> Result<ProcessingResult> {
        let key = Self::fingerprint(ctx);

        if let Some(mut cached) = self.lookup(&key) {
            log::debug!("Cache hit for node '{}'", ctx.node_id);
            cached.metadata.cache_hit = true;
            return Ok(cached);
        }
        log::debug!("Cache miss for node '{}'", ctx.node_id);

        let result = next.run(ctx).await?;
        if result.success {
            self.store(key, result.clone());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{NodeInputs, NodeProcessor, ProcessorPipeline};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails on the first call, succeeds with a call counter afterwards
    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NodeProcessor for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute_core(&self, _ctx: &ProcessingContext) -> Result<ProcessingResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Ok(ProcessingResult::failure("transient"));
            }
            Ok(ProcessingResult::success(json!({"call": call})))
        }
    }

    fn setup(ttl: Duration, capacity: usize) -> (Arc<Flaky>, Arc<CachingMiddleware>, ProcessorPipeline) {
        let processor = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(CachingMiddleware::new(ttl, capacity));
        let pipeline = ProcessorPipeline::new(processor.clone()).with_middleware(cache.clone());
        (processor, cache, pipeline)
    }

    fn ctx(node: &str, value: i64) -> ProcessingContext {
        ProcessingContext::new(node, "exec", NodeInputs::new().with("up", json!(value)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_not_cached_then_hit() {
        let (processor, cache, pipeline) = setup(Duration::from_secs(300), 16);

        let first = pipeline.process(&ctx("n", 1)).await;
        assert!(!first.success);
        assert!(cache.is_empty());

        let second = pipeline.process(&ctx("n", 1)).await;
        assert!(second.success);
        assert!(!second.metadata.cache_hit);

        let third = pipeline.process(&ctx("n", 1)).await;
        assert!(third.metadata.cache_hit);
        assert_eq!(third.data, second.data);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let (processor, cache, pipeline) = setup(Duration::from_secs(300), 16);
        pipeline.process(&ctx("n", 1)).await;
        pipeline.process(&ctx("n", 1)).await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(pipeline.process(&ctx("n", 1)).await.metadata.cache_hit);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        let fresh = pipeline.process(&ctx("n", 1)).await;
        assert!(!fresh.metadata.cache_hit);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fingerprint_distinguishes_node_and_inputs() {
        let a = CachingMiddleware::fingerprint(&ctx("n", 1));
        let b = CachingMiddleware::fingerprint(&ctx("n", 2));
        let c = CachingMiddleware::fingerprint(&ctx("m", 1));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("n-"));

        let reordered = ProcessingContext::new(
            "n",
            "other-exec",
            NodeInputs::new().with("y", json!(2)).with("x", json!(1)),
        );
        let ordered = ProcessingContext::new(
            "n",
            "exec",
            NodeInputs::new().with("x", json!(1)).with("y", json!(2)),
        );
        assert_eq!(
            CachingMiddleware::fingerprint(&reordered),
            CachingMiddleware::fingerprint(&ordered)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_at_capacity() {
        let (_processor, cache, pipeline) = setup(Duration::from_secs(300), 2);
        pipeline.process(&ctx("warmup", 0)).await;

        pipeline.process(&ctx("a", 1)).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        pipeline.process(&ctx("b", 1)).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        // touch a so b becomes least recently used
        assert!(pipeline.process(&ctx("a", 1)).await.metadata.cache_hit);
        tokio::time::advance(Duration::from_millis(10)).await;
        pipeline.process(&ctx("c", 1)).await;

        assert_eq!(cache.len(), 2);
        assert!(pipeline.process(&ctx("a", 1)).await.metadata.cache_hit);
        assert!(!pipeline.process(&ctx("b", 1)).await.metadata.cache_hit);
    }
}
