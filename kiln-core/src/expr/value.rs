//! Value semantics for the expression evaluator
//!
//! Expressions operate on `serde_json::Value` so step outputs, workflow
//! fields, and loop bindings flow through without conversion.

use serde_json::Value;
use std::cmp::Ordering;

/// Truthiness used by conditions and the ternary operator.
///
/// Null and false are falsy; numbers are falsy at zero; a string is falsy
/// when empty or exactly "false" (shell and step outputs are strings, and
/// a recorded "false" must not read as true).
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value for string interpolation: strings stay bare, everything
/// else is JSON-encoded.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Compare two values for ordering and equality.
///
/// Numbers compare numerically (so `1 == 1.0`), strings lexicographically.
/// Mixed or unordered types return `None` for ordering but still support
/// equality through `Value`'s own semantics.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64()?, b.as_f64()?);
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality with numeric coercion between integer and float forms.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            compare_values(left, right) == Some(Ordering::Equal)
        }
        _ => left == right,
    }
}
