//! Small helpers for building JavaScript snippets safely.

use serde_json::Value;

/// Render a Rust string as a JavaScript string literal. JSON string
/// encoding is a subset of JS, so the serializer does the escaping.
pub fn str_lit(raw: &str) -> String {
    Value::String(raw.to_owned()).to_string()
}
