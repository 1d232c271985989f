//! Schema validation of raw model output.

use lean_prompts::{FieldKind, FieldSpec, ResponseSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

/// Pseudo-field used for errors about the response as a whole.
pub const ROOT_FIELD: &str = "$";

/// What went wrong with a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum FieldProblem {
    /// The field is absent.
    Missing,
    /// The field holds a value of another JSON type.
    WrongType {
        /// JSON type actually found.
        found: String,
    },
    /// A numeric field lies outside its declared range.
    OutOfRange {
        /// Offending value.
        value: f64,
    },
    /// An integer field holds a fractional number.
    NotAnInteger {
        /// Offending value.
        value: f64,
    },
    /// The response is not a JSON object.
    Malformed {
        /// Parser or shape diagnostic.
        reason: String,
    },
}

/// A single validation failure, named after the field it concerns.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{}", describe(.field, .expected, .problem))]
pub struct FieldError {
    field: String,
    expected: String,
    #[serde(flatten)]
    problem: FieldProblem,
}

impl FieldError {
    /// Creates a field error.
    #[must_use]
    pub fn new(field: impl Into<String>, expected: impl Into<String>, problem: FieldProblem) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
            problem,
        }
    }

    fn root(reason: impl Into<String>) -> Self {
        Self::new(
            ROOT_FIELD,
            "a JSON object",
            FieldProblem::Malformed {
                reason: reason.into(),
            },
        )
    }

    /// Returns the field name, or [`ROOT_FIELD`] for whole-response errors.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Returns the human-readable expectation, e.g. `a number in [0,1]`.
    #[must_use]
    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// Returns the problem kind.
    #[must_use]
    pub const fn problem(&self) -> &FieldProblem {
        &self.problem
    }
}

fn describe(field: &str, expected: &str, problem: &FieldProblem) -> String {
    match problem {
        FieldProblem::Missing => format!("field `{field}` is missing; expected {expected}"),
        FieldProblem::WrongType { found } => {
            format!("field `{field}` must be {expected}, got {found}")
        }
        FieldProblem::OutOfRange { value } | FieldProblem::NotAnInteger { value } => {
            format!("field `{field}` must be {expected}, got {value}")
        }
        FieldProblem::Malformed { reason } => format!("response must be {expected}: {reason}"),
    }
}

/// Outcome of validating one response.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// The response conforms; carries the parsed value.
    Valid(Value),
    /// The response violates the schema; carries every field error.
    Invalid(Vec<FieldError>),
}

impl ValidationResult {
    /// Returns `true` for [`ValidationResult::Valid`].
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Returns the field errors, empty when valid.
    #[must_use]
    pub fn errors(&self) -> &[FieldError] {
        match self {
            Self::Valid(_) => &[],
            Self::Invalid(errors) => errors,
        }
    }

    /// Converts into a standard result.
    ///
    /// # Errors
    ///
    /// Returns the field errors when invalid.
    pub fn into_result(self) -> Result<Value, Vec<FieldError>> {
        match self {
            Self::Valid(value) => Ok(value),
            Self::Invalid(errors) => Err(errors),
        }
    }
}

/// Validates `raw` against `schema`.
///
/// Without a schema the raw text is accepted as a JSON string. With one, the
/// trimmed text must parse as a JSON object whose declared fields are present
/// with the declared types. Undeclared fields are ignored. Typing is strict:
/// `"0.9"` is not a number.
#[must_use]
pub fn validate(raw: &str, schema: Option<&ResponseSchema>) -> ValidationResult {
    let Some(schema) = schema else {
        return ValidationResult::Valid(Value::String(raw.to_owned()));
    };

    let value: Value = match serde_json::from_str(raw.trim()) {
        Ok(value) => value,
        Err(err) => {
            return ValidationResult::Invalid(vec![FieldError::root(format!(
                "not valid JSON ({err})"
            ))]);
        }
    };

    let Value::Object(object) = &value else {
        return ValidationResult::Invalid(vec![FieldError::root(format!(
            "got {}",
            json_type(&value)
        ))]);
    };

    let errors: Vec<FieldError> = schema
        .fields()
        .iter()
        .filter_map(|field| check_field(field, object.get(field.name())))
        .collect();

    trace!(fields = schema.fields().len(), errors = errors.len(), "validated response");

    if errors.is_empty() {
        ValidationResult::Valid(value)
    } else {
        ValidationResult::Invalid(errors)
    }
}

fn check_field(field: &FieldSpec, value: Option<&Value>) -> Option<FieldError> {
    let error = |problem| Some(FieldError::new(field.name(), field.expectation(), problem));

    let Some(value) = value else {
        return error(FieldProblem::Missing);
    };

    let type_matches = match field.kind() {
        FieldKind::String => value.is_string(),
        FieldKind::Number | FieldKind::Integer => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Array => value.is_array(),
        FieldKind::Object => value.is_object(),
    };
    if !type_matches {
        return error(FieldProblem::WrongType {
            found: json_type(value).to_owned(),
        });
    }

    let Some(number) = value.as_f64() else {
        return None;
    };

    if field.kind() == FieldKind::Integer && number.fract() != 0.0 {
        return error(FieldProblem::NotAnInteger { value: number });
    }

    match field.range() {
        Some(range) if !range.contains(number) => error(FieldProblem::OutOfRange { value: number }),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
