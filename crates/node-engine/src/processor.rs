//! Node processing contract
//!
//! A [`NodeProcessor`] implements the logic of one node type. Processors are
//! never called directly by the scheduler: they are wrapped in a
//! [`ProcessorPipeline`], whose [`process`](ProcessorPipeline::process) entry
//! point times the call, threads it through the middleware chain, and turns
//! every fault (error, timeout, panic, cancellation) into a failed
//! [`ProcessingResult`].

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::constants::{defaults, input_keys};
use crate::error::{NodeEngineError, Result};
use crate::middleware::{Middleware, Next};

/// Inputs of one node invocation, in upstream order
///
/// Keys are upstream node ids, plus [`input_keys::NODE_DATA`] for the node's
/// own configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInputs {
    entries: Vec<(String, Value)>,
}

impl NodeInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an input, keeping the first insertion position
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Upstream values, excluding the node's own configuration
    pub fn upstream_values(&self) -> impl Iterator<Item = &Value> {
        self.entries
            .iter()
            .filter(|(k, _)| k != input_keys::NODE_DATA)
            .map(|(_, v)| v)
    }

    /// Inputs keyed in sorted order, used for fingerprinting
    pub fn sorted(&self) -> BTreeMap<&str, &Value> {
        self.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Invocation metadata carried with the context
#[derive(Debug, Clone)]
pub struct ContextMetadata {
    /// Attempts made before this one
    pub retry_count: u32,
    /// When the scheduler dispatched the node
    pub start_time: DateTime<Utc>,
    /// Budget for a single processor attempt
    pub timeout: Duration,
}

impl Default for ContextMetadata {
    fn default() -> Self {
        Self {
            retry_count: 0,
            start_time: Utc::now(),
            timeout: defaults::DEFAULT_NODE_TIMEOUT,
        }
    }
}

/// Caller-supplied environment: provider credentials and free-form settings
///
/// Injected by the host, never owned by a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Environment {
    /// Provider id → API key
    pub api_keys: HashMap<String, String>,
    pub settings: HashMap<String, Value>,
}

impl Environment {
    pub fn with_api_key(mut self, provider: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider.into(), key.into());
        self
    }

    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys.get(provider).map(String::as_str)
    }
}

/// Per-node invocation record passed through the middleware chain
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub node_id: String,
    pub execution_id: String,
    pub inputs: NodeInputs,
    pub metadata: ContextMetadata,
    pub environment: Arc<Environment>,
    /// Fires when the owning execution is cancelled
    pub cancel: CancellationToken,
}

impl ProcessingContext {
    pub fn new(node_id: impl Into<String>, execution_id: impl Into<String>, inputs: NodeInputs) -> Self {
        Self {
            node_id: node_id.into(),
            execution_id: execution_id.into(),
            inputs,
            metadata: ContextMetadata::default(),
            environment: Arc::new(Environment::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_environment(mut self, environment: Arc<Environment>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.metadata.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The node's own configuration, or `Null` when absent
    pub fn node_data(&self) -> &Value {
        self.inputs.get(input_keys::NODE_DATA).unwrap_or(&Value::Null)
    }
}

/// Metadata present on every result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    /// Wall-clock time measured by the pipeline, in milliseconds
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default)]
    pub cache_hit: bool,
    /// Attempts made before this result, stamped by the retry middleware
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    /// Resident memory sample in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
}

/// Outcome of one node invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ResultMetadata,
}

impl ProcessingResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: ResultMetadata::default(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: ResultMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Type-specific node logic
///
/// `execute_core` may return `Err` or even panic; the pipeline converts both
/// into failed results.
#[async_trait]
pub trait NodeProcessor: Send + Sync {
    /// Processor name for logs
    fn name(&self) -> &str;

    async fn execute_core(&self, ctx: &ProcessingContext) -> Result<ProcessingResult>;
}

/// A processor plus its ordered middleware chain
///
/// Middleware registered first wraps everything registered after it.
pub struct ProcessorPipeline {
    processor: Arc<dyn NodeProcessor>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl ProcessorPipeline {
    pub fn new(processor: Arc<dyn NodeProcessor>) -> Self {
        Self {
            processor,
            middleware: Vec::new(),
        }
    }

    /// Append a middleware; it runs inside every middleware added before it
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn processor_name(&self) -> &str {
        self.processor.name()
    }

    pub fn middleware_names(&self) -> Vec<&str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    /// Run the node; never fails
    pub async fn process(&self, ctx: &ProcessingContext) -> ProcessingResult {
        let started = Instant::now();
        let chain = Next::new(&self.middleware, self.processor.as_ref());

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(NodeEngineError::Cancelled),
            res = AssertUnwindSafe(chain.run(ctx)).catch_unwind() => match res {
                Ok(res) => res,
                Err(panic) => Err(NodeEngineError::failed(format!(
                    "Processor '{}' panicked: {}",
                    self.processor.name(),
                    panic_message(panic.as_ref())
                ))),
            },
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Node '{}' ({}) failed: {}", ctx.node_id, self.processor.name(), e);
                ProcessingResult::failure(e.to_string())
            }
        };
        result.metadata.execution_time_ms = started.elapsed().as_millis() as u64;
        result
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
