//! Flat field schemas for step inputs and outputs.
//!
//! A schema maps field names to a primitive [`FieldType`]. Definitions use it
//! to prove at publish time that every field a step consumes is produced by
//! one of its dependencies (or by the workflow input), and the engine uses it
//! at run time to check step outputs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    /// Whether a JSON value satisfies this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    /// Whether a producer declaring `produced` satisfies a consumer expecting
    /// `self`.
    pub fn accepts(&self, produced: FieldType) -> bool {
        match (self, produced) {
            (FieldType::Any, _) => true,
            (FieldType::Number, FieldType::Integer) => true,
            (expected, actual) => *expected == actual,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        };
        f.write_str(name)
    }
}

/// Declared fields of a step input or output. An empty schema accepts any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: BTreeMap<String, FieldType>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Check a payload against the schema. Extra fields are allowed.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let Some(object) = value.as_object() else {
            return Err(format!("expected an object, got {}", json_kind(value)));
        };
        for (name, field_type) in &self.fields {
            match object.get(name) {
                None => return Err(format!("missing field '{name}'")),
                Some(v) if !field_type.matches(v) => {
                    return Err(format!(
                        "field '{name}' should be {field_type}, got {}",
                        json_kind(v)
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
