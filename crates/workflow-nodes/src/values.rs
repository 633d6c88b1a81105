//! Loose value semantics shared by the node processors
//!
//! Workflow payloads are untyped JSON. Nodes judge them the way a workflow
//! author writing configuration expects: `""`, `0`, `false` and `null` are
//! "empty", arrays report their type as `object`.

use serde_json::Value;

/// Type name of a value as reported to schema checks
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
    }
}

/// Whether a value counts as present
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text rendering: strings verbatim, everything else as compact JSON
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Read an unsigned integer parameter, accepting floats and numeric strings
pub fn as_count(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
