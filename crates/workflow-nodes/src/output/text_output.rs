//! Text Output Processor
//!
//! Collects every upstream output into the workflow's final result.
//!
//! # Node data
//! - `format` (optional) - `json`, `text`, anything else is `raw`
//!
//! # Output
//! `{ "output": ..., "format": ..., "timestamp": ..., "nodeId": ... }` where
//! `output` is the list of inputs, or for `text` the inputs rendered and
//! joined by newlines.

use async_trait::async_trait;
use chrono::Utc;
use node_engine::{NodeProcessor, ProcessingContext, ProcessingResult, Result};
use serde_json::{json, Value};

use crate::values::to_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
    Raw,
}

impl OutputFormat {
    pub fn parse(format: Option<&str>) -> Self {
        match format {
            Some("json") => Self::Json,
            Some("text") => Self::Text,
            _ => Self::Raw,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TextOutputProcessor;

impl TextOutputProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeProcessor for TextOutputProcessor {
    fn name(&self) -> &str {
        "text-output"
    }

    async fn execute_core(&self, ctx: &ProcessingContext) -> Result<ProcessingResult> {
        let format = OutputFormat::parse(ctx.node_data().get("format").and_then(Value::as_str));
        let inputs: Vec<Value> = ctx.inputs.upstream_values().cloned().collect();

        log::debug!(
            "TextOutput {}: {} input(s) as {}",
            ctx.node_id,
            inputs.len(),
            format.as_str()
        );

        let output = match format {
            OutputFormat::Text => Value::String(
                inputs.iter().map(to_text).collect::<Vec<_>>().join("\n"),
            ),
            OutputFormat::Json | OutputFormat::Raw => Value::Array(inputs),
        };

        Ok(ProcessingResult::success(json!({
            "output": output,
            "format": format.as_str(),
            "timestamp": Utc::now(),
            "nodeId": ctx.node_id,
        })))
    }
}
