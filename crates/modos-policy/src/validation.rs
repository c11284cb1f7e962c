//! Structural request validation.
//!
//! Checks required presence, primitive types, `minLength`, and `minimum`.
//! Fields are checked in declaration order (body, then query, then params)
//! and the first violation is reported.

use std::collections::BTreeMap;

use modos_protocol::{FieldSchema, FieldType, ObjectSchema, RuntimeError, RuntimeResult, ValidationSchema};
use serde_json::{Map, Value};

fn violation(message: String) -> RuntimeError {
    RuntimeError::Validation(message)
}

fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
    }
}

fn check_field(location: &str, name: &str, schema: &FieldSchema, value: &Value) -> RuntimeResult<()> {
    if let Some(field_type) = schema.field_type
        && !type_matches(field_type, value)
    {
        return Err(violation(format!(
            "{location}.{name} must be of type {}",
            field_type.as_str()
        )));
    }
    if let Some(min_length) = schema.min_length {
        let length = match value {
            Value::String(text) => Some(text.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let Some(length) = length
            && length < min_length
        {
            return Err(violation(format!(
                "{location}.{name} must have length of at least {min_length}"
            )));
        }
    }
    if let Some(minimum) = schema.minimum
        && let Some(number) = value.as_f64()
        && number < minimum
    {
        return Err(violation(format!("{location}.{name} must be >= {minimum}")));
    }
    Ok(())
}

fn check_object(location: &str, schema: &ObjectSchema, fields: &Map<String, Value>) -> RuntimeResult<()> {
    for (name, field) in schema {
        match fields.get(name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(violation(format!("{location}.{name} is required")));
                }
            }
            Some(value) => check_field(location, name, field, value)?,
        }
    }
    Ok(())
}

/// Query and path values arrive as strings; coerce them toward the declared
/// type so `integer`/`number`/`boolean` checks are meaningful.
fn coerce(schema: &FieldSchema, raw: &str) -> Value {
    match schema.field_type {
        Some(FieldType::Integer) => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_owned())),
        Some(FieldType::Number) => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_owned())),
        Some(FieldType::Boolean) => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_owned()),
        },
        Some(FieldType::Object | FieldType::Array) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
        }
        Some(FieldType::String) | None => Value::String(raw.to_owned()),
    }
}

fn check_strings(
    location: &str,
    schema: &ObjectSchema,
    values: &BTreeMap<String, String>,
) -> RuntimeResult<()> {
    let fields: Map<String, Value> = schema
        .iter()
        .filter_map(|(name, field)| {
            values
                .get(name)
                .map(|raw| (name.clone(), coerce(field, raw)))
        })
        .collect();
    check_object(location, schema, &fields)
}

pub fn validate_request(
    schema: &ValidationSchema,
    body: Option<&Value>,
    query: &BTreeMap<String, String>,
    params: &BTreeMap<String, String>,
) -> RuntimeResult<()> {
    if let Some(body_schema) = &schema.body {
        let empty = Map::new();
        let fields = match body {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(fields)) => fields,
            Some(_) => return Err(violation("body must be a JSON object".to_owned())),
        };
        check_object("body", body_schema, fields)?;
    }
    if let Some(query_schema) = &schema.query {
        check_strings("query", query_schema, query)?;
    }
    if let Some(params_schema) = &schema.params {
        check_strings("params", params_schema, params)?;
    }
    Ok(())
}
