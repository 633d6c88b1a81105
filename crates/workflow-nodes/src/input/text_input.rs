//! Text Input Processor
//!
//! Emits the text the workflow author typed into the node. Upstream inputs
//! are ignored.
//!
//! # Node data
//! - `content` (optional) - the text; empty when absent
//!
//! # Output
//! `{ "text": content, "timestamp": ..., "nodeId": ... }`

use async_trait::async_trait;
use chrono::Utc;
use node_engine::{NodeProcessor, ProcessingContext, ProcessingResult, Result};
use serde_json::{json, Value};

use crate::values::{is_truthy, to_text};

#[derive(Debug, Clone, Copy, Default)]
pub struct TextInputProcessor;

impl TextInputProcessor {
    /// Node data key holding the text
    pub const KEY_CONTENT: &'static str = "content";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeProcessor for TextInputProcessor {
    fn name(&self) -> &str {
        "text-input"
    }

    async fn execute_core(&self, ctx: &ProcessingContext) -> Result<ProcessingResult> {
        let text = ctx
            .node_data()
            .get(Self::KEY_CONTENT)
            .filter(|v| is_truthy(v))
            .map(to_text)
            .unwrap_or_default();

        log::debug!("TextInput {}: emitting {} chars", ctx.node_id, text.len());

        Ok(ProcessingResult::success(json!({
            "text": Value::String(text),
            "timestamp": Utc::now(),
            "nodeId": ctx.node_id,
        })))
    }
}
