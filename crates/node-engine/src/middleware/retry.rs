//! Retry with exponential backoff
//!
//! Retries both failed results and errors. The delay after attempt `n`
//! (0-based) is `base_delay * 2^n`. The last attempt's result is returned
//! as-is; an error on the last attempt becomes a failed result naming the
//! attempt count. Configuration errors and cancellation are never retried.

use async_trait::async_trait;

use super::{Middleware, Next};
use crate::config::RetryConfig;
use crate::error::{NodeEngineError, Result};
use crate::processor::{ProcessingContext, ProcessingResult};

pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn execute(&self, ctx: &ProcessingContext, next: Next<'_>) -> Result<ProcessingResult> {
        let max_retries = self.config.max_retries;
        let mut attempt = 0;

        loop {
            let mut attempt_ctx = ctx.clone();
            attempt_ctx.metadata.retry_count = attempt;
            let is_last = attempt >= max_retries;

            match next.run(&attempt_ctx).await {
                Ok(mut result) if result.success || is_last => {
                    result.metadata.retry_count = attempt;
                    return Ok(result);
                }
                Ok(result) => {
                    log::warn!(
                        "Node '{}' attempt {} failed: {}",
                        ctx.node_id,
                        attempt + 1,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
                Err(e @ (NodeEngineError::Cancelled | NodeEngineError::InvalidConfig(_))) => {
                    return Err(e)
                }
                Err(e) if is_last => {
                    let mut result = ProcessingResult::failure(format!(
                        "Failed after {} attempts: {}",
                        attempt + 1,
                        e
                    ));
                    result.metadata.retry_count = attempt;
                    return Ok(result);
                }
                Err(e) => {
                    log::warn!("Node '{}' attempt {} errored: {}", ctx.node_id, attempt + 1, e);
                }
            }

            let delay = self.config.delay_for(attempt);
            log::debug!(
                "Retrying node '{}' in {}ms",
                ctx.node_id,
                delay.as_millis()
            );
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(NodeEngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{NodeInputs, NodeProcessor, ProcessorPipeline};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Fails its first `failures` calls, recording each attempt's retry count
    struct Scripted {
        failures: u32,
        erroring: bool,
        seen: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(failures: u32, erroring: bool) -> Arc<Self> {
            Arc::new(Self {
                failures,
                erroring,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NodeProcessor for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute_core(&self, ctx: &ProcessingContext) -> Result<ProcessingResult> {
            let mut seen = self.seen.lock();
            seen.push(ctx.metadata.retry_count);
            if (seen.len() as u32) <= self.failures {
                if self.erroring {
                    return Err(NodeEngineError::failed("provider unreachable"));
                }
                return Ok(ProcessingResult::failure("rate limited"));
            }
            Ok(ProcessingResult::success(json!("ok")))
        }
    }

    fn pipeline(processor: Arc<Scripted>) -> ProcessorPipeline {
        ProcessorPipeline::new(processor).with_middleware(Arc::new(RetryMiddleware::default()))
    }

    fn ctx() -> ProcessingContext {
        ProcessingContext::new("n", "exec", NodeInputs::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deterministic_failure_runs_four_times() {
        let processor = Scripted::new(u32::MAX, false);
        let started = Instant::now();

        let result = pipeline(processor.clone()).process(&ctx()).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("rate limited"));
        assert_eq!(result.metadata.retry_count, 3);
        assert_eq!(*processor.seen.lock(), vec![0, 1, 2, 3]);
        assert!(started.elapsed() >= Duration::from_millis(1000 + 2000 + 4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_on_last_attempt_names_attempts() {
        let processor = Scripted::new(u32::MAX, true);
        let result = pipeline(processor).process(&ctx()).await;
        assert_eq!(
            result.error.as_deref(),
            Some("Failed after 4 attempts: Execution failed: provider unreachable")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let processor = Scripted::new(2, true);
        let started = Instant::now();

        let result = pipeline(processor.clone()).process(&ctx()).await;

        assert!(result.success);
        assert_eq!(result.metadata.retry_count, 2);
        assert_eq!(processor.seen.lock().len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(3000));
        assert!(started.elapsed() < Duration::from_millis(7000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_aborts_on_cancel() {
        let processor = Scripted::new(u32::MAX, false);
        let context = ctx();
        let cancel = context.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        });

        let result = pipeline(processor.clone()).process(&context).await;

        assert_eq!(result.error.as_deref(), Some("Execution cancelled"));
        assert_eq!(processor.seen.lock().len(), 2);
    }

    struct Misconfigured {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl NodeProcessor for Misconfigured {
        fn name(&self) -> &str {
            "misconfigured"
        }

        async fn execute_core(&self, _ctx: &ProcessingContext) -> Result<ProcessingResult> {
            *self.calls.lock() += 1;
            Err(NodeEngineError::InvalidConfig("missing apiKey".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_error_is_not_retried() {
        let processor = Arc::new(Misconfigured {
            calls: Mutex::new(0),
        });
        let pipeline = ProcessorPipeline::new(processor.clone())
            .with_middleware(Arc::new(RetryMiddleware::default()));

        let result = pipeline.process(&ctx()).await;

        assert_eq!(*processor.calls.lock(), 1);
        assert_eq!(
            result.error.as_deref(),
            Some("Invalid configuration: missing apiKey")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_is_single_attempt() {
        let processor = Scripted::new(u32::MAX, true);
        let pipeline = ProcessorPipeline::new(processor.clone()).with_middleware(Arc::new(
            RetryMiddleware::new(RetryConfig {
                max_retries: 0,
                base_delay: Duration::from_millis(10),
            }),
        ));

        let result = pipeline.process(&ctx()).await;
        assert_eq!(processor.seen.lock().len(), 1);
        assert!(result.error.unwrap().starts_with("Failed after 1 attempts"));
    }
}
