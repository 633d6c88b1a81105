//! Middleware chain around node processors
//!
//! Each [`Middleware`] receives the context and a [`Next`] handle for the
//! rest of the chain. The chain is an immutable slice walked by index; the
//! last step calls the processor's `execute_core` under the per-attempt
//! timeout from the context.

pub mod caching;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::{NodeEngineError, Result};
use crate::processor::{NodeProcessor, ProcessingContext, ProcessingResult};

pub use caching::CachingMiddleware;
pub use retry::RetryMiddleware;

/// A cross-cutting behavior wrapped around node execution
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Middleware name for logs
    fn name(&self) -> &str;

    /// Handle one invocation; call `next.run(ctx)` to continue down the chain
    async fn execute(&self, ctx: &ProcessingContext, next: Next<'_>) -> Result<ProcessingResult>;
}

/// The remainder of a middleware chain
///
/// `Next` is `Copy`, so a middleware may run the rest of the chain several
/// times (the retry middleware does).
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    processor: &'a dyn NodeProcessor,
}

impl<'a> Next<'a> {
    pub fn new(middleware: &'a [Arc<dyn Middleware>], processor: &'a dyn NodeProcessor) -> Self {
        Self {
            middleware,
            processor,
        }
    }

    /// Run the remaining middleware, then the processor
    pub fn run<'b>(self, ctx: &'b ProcessingContext) -> BoxFuture<'b, Result<ProcessingResult>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.middleware.split_first() {
                Some((current, rest)) => {
                    let next = Next::new(rest, self.processor);
                    current.execute(ctx, next).await
                }
                None => invoke_core(self.processor, ctx).await,
            }
        })
    }
}

async fn invoke_core(processor: &dyn NodeProcessor, ctx: &ProcessingContext) -> Result<ProcessingResult> {
    let budget = ctx.metadata.timeout;
    match tokio::time::timeout(budget, processor.execute_core(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(NodeEngineError::Timeout {
            node_id: ctx.node_id.clone(),
            after: budget,
        }),
    }
}
