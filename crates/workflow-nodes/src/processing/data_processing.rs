//! Data Processing Processor
//!
//! Shapes the values produced by upstream nodes without calling out to any
//! service. The node's configuration picks a processing type and an
//! operation:
//!
//! | type        | operations                                          |
//! |-------------|-----------------------------------------------------|
//! | `transform` | `json`, `text`, `uppercase`, `lowercase`, `extract` |
//! | `filter`    | `removeEmpty`, `removeNull`, `unique`, `length`     |
//! | `branch`    | condition parameter: `random`, `hasData`, `isEmpty` |
//! | `aggregate` | `count`, `concat`, `average`                        |
//! | `validate`  | schema parameter: `required`, `type`, `minLength`   |
//!
//! Unknown types and operations pass the input list through unchanged.
//! This processor always succeeds.

use async_trait::async_trait;
use chrono::Utc;
use node_engine::{NodeProcessor, ProcessingContext, ProcessingResult, ResultMetadata, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::values::{as_count, is_truthy, to_text, type_name};

/// Node configuration read from `nodeData`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessingConfig {
    /// `transform` when absent
    pub processing_type: Option<String>,
    /// Preferred over `operation` when both are set
    pub transform_type: Option<String>,
    pub operation: Option<String>,
    pub parameters: Map<String, Value>,
}

impl ProcessingConfig {
    /// Read from node data; anything unparseable yields the defaults
    pub fn from_node_data(node_data: &Value) -> Self {
        if node_data.is_null() {
            return Self::default();
        }
        serde_json::from_value(node_data.clone()).unwrap_or_else(|e| {
            log::warn!("Ignoring malformed processing config: {}", e);
            Self::default()
        })
    }

    pub fn kind(&self) -> &str {
        non_empty(self.processing_type.as_deref()).unwrap_or("transform")
    }

    pub fn operation(&self) -> &str {
        non_empty(self.transform_type.as_deref())
            .or_else(|| non_empty(self.operation.as_deref()))
            .unwrap_or("passthrough")
    }

    fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

/// Source of the coin flip used by the `random` branch condition
pub type CoinFlip = fn() -> bool;

fn fair_coin() -> bool {
    rand::random::<f64>() > 0.5
}

/// Processor for `processing` and `advancedProcessing` nodes
pub struct DataProcessingProcessor {
    coin: CoinFlip,
}

impl DataProcessingProcessor {
    pub fn new() -> Self {
        Self { coin: fair_coin }
    }

    /// Replace the coin used by the `random` branch condition
    pub fn with_coin(mut self, coin: CoinFlip) -> Self {
        self.coin = coin;
        self
    }

    /// Apply a configuration to an input list
    pub fn apply(&self, items: Vec<Value>, config: &ProcessingConfig) -> Value {
        match config.kind() {
            "transform" => transform(items, config),
            "filter" => Value::Array(filter(items, config)),
            "branch" => self.branch(items, config),
            "aggregate" => aggregate(items, config),
            "validate" => validate(items, config),
            other => {
                log::debug!("Unknown processing type '{}', passing input through", other);
                Value::Array(items)
            }
        }
    }

    fn branch(&self, items: Vec<Value>, config: &ProcessingConfig) -> Value {
        let condition = config
            .parameter("condition")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("random");

        let taken = match condition {
            "random" => (self.coin)(),
            "hasData" => !items.is_empty(),
            "isEmpty" => items.is_empty(),
            _ => false,
        };

        json!({
            "condition": taken,
            "path": if taken { "true" } else { "false" },
            "data": items,
            "branchingLogic": condition,
        })
    }
}

impl Default for DataProcessingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn transform(items: Vec<Value>, config: &ProcessingConfig) -> Value {
    match config.operation() {
        "json" => json!({
            "type": "json",
            "data": items,
            "transformed": true,
            "timestamp": Utc::now(),
        }),
        "text" => json!({
            "type": "text",
            "text": join_text(&items),
            "transformed": true,
        }),
        "uppercase" => map_strings(items, |s| s.to_uppercase()),
        "lowercase" => map_strings(items, |s| s.to_lowercase()),
        "extract" => {
            let field = config
                .parameter("field")
                .and_then(Value::as_str)
                .filter(|f| !f.is_empty());
            Value::Array(
                items
                    .into_iter()
                    .map(|item| match (field, type_name(&item)) {
                        (Some(field), "object") => item.get(field).cloned().unwrap_or(Value::Null),
                        _ => item,
                    })
                    .collect(),
            )
        }
        _ => Value::Array(items),
    }
}

fn map_strings(items: Vec<Value>, f: impl Fn(&str) -> String) -> Value {
    Value::Array(
        items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Value::String(f(&s)),
                other => other,
            })
            .collect(),
    )
}

fn join_text(items: &[Value]) -> String {
    items.iter().map(to_text).collect::<Vec<_>>().join(" ")
}

fn filter(items: Vec<Value>, config: &ProcessingConfig) -> Vec<Value> {
    match config.operation() {
        "removeEmpty" => items
            .into_iter()
            .filter(|item| !item.is_null() && item.as_str() != Some(""))
            .collect(),
        "removeNull" => items.into_iter().filter(|item| !item.is_null()).collect(),
        "unique" => {
            let mut seen: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                if !seen.contains(&item) {
                    seen.push(item);
                }
            }
            seen
        }
        "length" => {
            let min_length = as_count(config.parameter("minLength")).unwrap_or(0);
            items
                .into_iter()
                .filter(|item| match item {
                    Value::String(s) => s.chars().count() >= min_length,
                    _ => true,
                })
                .collect()
        }
        _ => items,
    }
}

fn aggregate(items: Vec<Value>, config: &ProcessingConfig) -> Value {
    match config.operation() {
        "count" => json!({ "count": items.len(), "items": items }),
        "concat" => json!({ "text": join_text(&items), "itemCount": items.len() }),
        "average" => {
            let numbers: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
            let average = if numbers.is_empty() {
                0.0
            } else {
                numbers.iter().sum::<f64>() / numbers.len() as f64
            };
            json!({ "average": average, "count": numbers.len() })
        }
        _ => json!({ "count": items.len(), "items": items }),
    }
}

fn validate(items: Vec<Value>, config: &ProcessingConfig) -> Value {
    let empty = Value::Object(Map::new());
    let schema = config.parameter("schema").unwrap_or(&empty);

    let results: Vec<Value> = items
        .into_iter()
        .map(|item| {
            let errors = check_item(&item, schema);
            json!({ "item": item, "valid": errors.is_empty(), "errors": errors })
        })
        .collect();

    let valid_count = results.iter().filter(|r| r["valid"] == true).count();
    json!({
        "validCount": valid_count,
        "totalCount": results.len(),
        "validationPassed": valid_count == results.len(),
        "results": results,
    })
}

fn check_item(item: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    if schema.get("required").is_some_and(is_truthy) && !is_truthy(item) {
        errors.push("Item is required".to_string());
    }

    if let Some(expected) = schema.get("type").and_then(Value::as_str).filter(|t| !t.is_empty()) {
        let actual = type_name(item);
        if expected != actual {
            errors.push(format!("Expected {}, got {}", expected, actual));
        }
    }

    if let (Some(min), Value::String(s)) = (as_count(schema.get("minLength")), item) {
        if min > 0 && s.chars().count() < min {
            errors.push(format!("Minimum length is {}", min));
        }
    }

    errors
}

#[async_trait]
impl NodeProcessor for DataProcessingProcessor {
    fn name(&self) -> &str {
        "data-processing"
    }

    async fn execute_core(&self, ctx: &ProcessingContext) -> Result<ProcessingResult> {
        let config = ProcessingConfig::from_node_data(ctx.node_data());
        let items: Vec<Value> = ctx.inputs.upstream_values().cloned().collect();

        log::debug!(
            "DataProcessing {}: {}/{} over {} item(s)",
            ctx.node_id,
            config.kind(),
            config.operation(),
            items.len()
        );

        let data = self.apply(items, &config);
        Ok(ProcessingResult::success(data).with_metadata(ResultMetadata {
            tokens_used: Some(0),
            ..Default::default()
        }))
    }
}
