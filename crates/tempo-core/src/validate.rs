//! Pre-execution input validation.
//!
//! A validator checks an input record against the compiler's input form
//! schema and reports one error per offending top-level field. Callers that
//! get a non-empty list skip stepping and surface [`ValidationErrors`]
//! as a single message.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{InputField, InputSchema, Record};

/// One offending input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub path: Vec<String>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            path: vec![field.clone()],
            field,
            message: message.into(),
        }
    }
}

/// Aggregate of field errors, displayed as one multi-line message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "Input validation errors:")?;
        for e in &self.0 {
            write!(f, "\n  • {}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Pluggable pre-check run before a step.
pub trait InputValidator: Send + Sync {
    fn validate(&self, input: &Record, schema: &InputSchema) -> Vec<FieldError>;
}

impl<F> InputValidator for F
where
    F: Fn(&Record, &InputSchema) -> Vec<FieldError> + Send + Sync,
{
    fn validate(&self, input: &Record, schema: &InputSchema) -> Vec<FieldError> {
        self(input, schema)
    }
}

/// Structural type check driven by the input form schema.
///
/// Every declared field must be present. Fields not in the schema (such as
/// the injected `step`) are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl InputValidator for SchemaValidator {
    fn validate(&self, input: &Record, schema: &InputSchema) -> Vec<FieldError> {
        schema
            .iter()
            .filter_map(|(name, field)| match input.get(name) {
                None => Some(FieldError::new(name, "Required field missing")),
                Some(value) => check(field, value).map(|message| FieldError::new(name, message)),
            })
            .collect()
    }
}

/// Run `validator` and wrap a non-empty result.
pub fn validate_input(
    validator: &dyn InputValidator,
    input: &Record,
    schema: &InputSchema,
) -> Result<(), ValidationErrors> {
    let errors = validator.validate(input, schema);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        _ => false,
    }
}

fn check(field: &InputField, value: &Value) -> Option<String> {
    let expected = |what: &str| Some(format!("Expected {}, got {}", what, type_name(value)));

    match field {
        InputField::String if !value.is_string() => expected("string"),
        InputField::Integer if !is_integer(value) => expected("integer"),
        InputField::Float if !value.is_number() => expected("number"),
        InputField::Boolean if !value.is_boolean() => expected("boolean"),
        InputField::Array { element } => match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| check(element, item).map(|e| format!("[{}]: {}", i, e))),
            _ => expected("array"),
        },
        InputField::Object { fields } => match value {
            Value::Object(map) => fields.iter().find_map(|(key, field)| match map.get(key) {
                None => Some(format!("{}: Required field missing", key)),
                Some(v) => check(field, v).map(|e| format!("{}: {}", key, e)),
            }),
            _ => expected("object"),
        },
        _ => None,
    }
}
