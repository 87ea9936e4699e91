// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tool argument validation against a JSON Schema.
//!
//! Checks (1) required fields are present and non-null, (2) provided
//! fields match the schema's primitive types. Returns `None` when valid,
//! `Some(message)` otherwise.

use serde_json::Value;

pub fn validate_args(tool_name: &str, schema: &Value, args: &Value) -> Option<String> {
    let mut errors = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required {
            if let Some(field_name) = field.as_str()
                && args
                    .get(field_name)
                    .map(Value::is_null)
                    .unwrap_or(true)
            {
                errors.push(format!("missing required parameter '{field_name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field_name, field_schema) in properties {
            if let Some(value) = args.get(field_name)
                && !value.is_null()
                && let Some(expected) = field_schema.get("type").and_then(Value::as_str)
            {
                let type_ok = match expected {
                    "string" => value.is_string(),
                    "number" | "integer" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !type_ok {
                    errors.push(format!(
                        "parameter '{field_name}' should be {expected} but got {}",
                        type_name(value)
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Invalid parameters for tool '{tool_name}': {}",
            errors.join("; ")
        ))
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}
