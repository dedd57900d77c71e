//! NDJSON parser for generate records.
//!
//! Implements tolerant reader pattern: unknown fields ignored, missing fields
//! defaulted. Only non-objects and wrongly typed known fields are rejected.

use serde_json::Value;

use super::types::GenerateChunk;
use crate::error::{Error, Result};

/// Parse a single NDJSON line from the generation stream.
pub fn parse_line(line: &str) -> Result<GenerateChunk> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(raw)
}

/// Parse a JSON value into a generate record.
pub fn parse_value(raw: Value) -> Result<GenerateChunk> {
    if !raw.is_object() {
        return Err(Error::NdjsonParse(format!(
            "Expected a JSON object, got {}",
            type_name(&raw)
        )));
    }
    Ok(serde_json::from_value(raw)?)
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
