//! Form schemas and the defaulting/coercion pass
//!
//! A submission is either committed whole (fully typed, schema-complete) or
//! rejected with the full list of per-field errors. There is no partial
//! commit.

use crate::error::{EngineError, FieldError};
use crate::types::AnswerMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Field type of a form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free-form single-line text
    Text,
    /// Masked text; implies redaction in echoes and logs
    Password,
    /// Numeric input with optional bounds
    Number,
    /// One value out of the declared options
    Select,
    /// Boolean toggle
    Checkbox,
    /// IPv4/IPv6 address
    Ip,
    /// URL
    Url,
    /// Email address
    Email,
    /// Multi-line text
    Textarea,
}

/// One choice of a select field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    /// Stored value
    pub value: String,
    /// Label shown by the renderer
    #[serde(default)]
    pub label: Option<String>,
}

/// A single field of a form schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    /// Field name, unique within the schema
    pub name: String,

    /// Label shown by the renderer
    #[serde(default)]
    pub label: Option<String>,

    /// Field type
    #[serde(rename = "type")]
    pub kind: FieldKind,

    /// Whether a value must be present after defaulting
    #[serde(default)]
    pub required: bool,

    /// Default substituted for absent or empty submissions
    #[serde(default)]
    pub default: Option<Value>,

    /// Lower numeric bound (inclusive)
    #[serde(default)]
    pub min: Option<f64>,

    /// Upper numeric bound (inclusive)
    #[serde(default)]
    pub max: Option<f64>,

    /// Numeric step hint for the renderer
    #[serde(default)]
    pub step: Option<f64>,

    /// Validation regex, matched against the whole coerced value
    #[serde(default)]
    pub pattern: Option<String>,

    /// Value must never appear unmasked in logs or echoes
    #[serde(default)]
    pub secret: bool,

    /// Hidden behind an "advanced" toggle; defaulted unless surfaced
    #[serde(default)]
    pub advanced: bool,

    /// Choices for select fields
    #[serde(default)]
    pub options: Vec<SelectOption>,
}

/// An ordered form schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSchema {
    /// Fields in declaration order
    pub fields: Vec<FormField>,
}

impl FormSchema {
    /// Validate the schema at flow load time
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(EngineError::FlowConfig(format!(
                    "Duplicate field name: {}",
                    field.name
                )));
            }
            if let Some(pattern) = &field.pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    EngineError::FlowConfig(format!(
                        "Field {} has an invalid pattern: {}",
                        field.name, e
                    ))
                })?;
            }
            if field.kind == FieldKind::Select && field.options.is_empty() {
                return Err(EngineError::FlowConfig(format!(
                    "Select field {} declares no options",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Names of all secret fields
    pub fn secret_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.secret || f.kind == FieldKind::Password)
            .map(|f| f.name.as_str())
    }
}

/// Whether a raw submission counts as "absent" for defaulting purposes
fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// The truthy set for checkbox coercion
fn checkbox_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim(), "true" | "1" | "on"),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn coerce_number(field: &FormField, value: &Value, errors: &mut Vec<FieldError>) -> Option<Value> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    let Some(number) = parsed else {
        errors.push(FieldError::new(
            &field.name,
            format!("not a number: {}", value),
        ));
        return None;
    };

    if let Some(min) = field.min {
        if number < min {
            errors.push(FieldError::new(&field.name, format!("below minimum {}", min)));
            return None;
        }
    }
    if let Some(max) = field.max {
        if number > max {
            errors.push(FieldError::new(&field.name, format!("above maximum {}", max)));
            return None;
        }
    }

    // Keep integers integral so round-trips stay stable
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Some(Value::from(number as i64))
    } else {
        Some(Value::from(number))
    }
}

fn coerce_string(field: &FormField, value: &Value, errors: &mut Vec<FieldError>) -> Option<Value> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => {
            errors.push(FieldError::new(
                &field.name,
                format!("expected a string, got {}", other),
            ));
            return None;
        }
    };

    if let Some(pattern) = &field.pattern {
        // Schema validation guarantees the pattern compiles
        if let Ok(re) = regex::Regex::new(pattern) {
            if !re.is_match(&text) {
                errors.push(FieldError::new(
                    &field.name,
                    format!("does not match pattern {}", pattern),
                ));
                return None;
            }
        }
    }

    if field.kind == FieldKind::Select
        && !field.options.is_empty()
        && !field.options.iter().any(|o| o.value == text)
    {
        errors.push(FieldError::new(&field.name, "not one of the declared options"));
        return None;
    }

    Some(Value::String(text))
}

/// Apply defaulting and coercion to a raw submission
///
/// Walks the schema in declaration order: absent/empty values (and advanced
/// fields that were not surfaced) take the field default, then each value
/// is coerced by its declared type. Numbers never silently fall back to
/// zero; a post-defaulting parse failure is a hard field error. The result
/// is a schema-complete typed map, or the full error list.
pub fn coerce_submission(schema: &FormSchema, raw: &AnswerMap) -> Result<AnswerMap, Vec<FieldError>> {
    let mut coerced = AnswerMap::new();
    let mut errors = Vec::new();

    for field in &schema.fields {
        let submitted = raw.get(&field.name);
        let effective = if is_absent(submitted) || (field.advanced && submitted.is_none()) {
            field.default.clone()
        } else {
            submitted.cloned()
        };

        let Some(value) = effective else {
            if field.required {
                errors.push(FieldError::new(&field.name, "required"));
            }
            continue;
        };

        let result = match field.kind {
            FieldKind::Number => coerce_number(field, &value, &mut errors),
            FieldKind::Checkbox => Some(Value::Bool(checkbox_truthy(&value))),
            _ => coerce_string(field, &value, &mut errors),
        };

        if let Some(value) = result {
            coerced.insert(field.name.clone(), value);
        }
    }

    if errors.is_empty() {
        Ok(coerced)
    } else {
        Err(errors)
    }
}

/// Replace secret field values with a mask for any echo or log path
pub fn redact(schema: &FormSchema, answers: &AnswerMap) -> AnswerMap {
    let secret: HashSet<&str> = schema.secret_fields().collect();
    let mut masked = AnswerMap::new();
    for (name, value) in answers {
        if secret.contains(name.as_str()) {
            masked.insert(name.clone(), Value::String("***".to_string()));
        } else {
            masked.insert(name.clone(), value.clone());
        }
    }
    masked
}
