//! Declarative response schemas.
//!
//! A schema is a flat list of named, typed fields. Documents declare field types
//! with a compact syntax such as `string`, `int`, or `float[0,1]`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PromptError, PromptResult};

/// JSON type expected for a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// JSON string.
    String,
    /// Any JSON number.
    Number,
    /// JSON number without a fractional part.
    Integer,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl FieldKind {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "string" | "str" | "text" => Self::String,
            "float" | "number" => Self::Number,
            "int" | "integer" => Self::Integer,
            "bool" | "boolean" => Self::Boolean,
            "array" | "list" => Self::Array,
            "object" | "dict" | "map" => Self::Object,
            _ => return None,
        })
    }

    const fn is_numeric(self) -> bool {
        matches!(self, Self::Number | Self::Integer)
    }

    const fn article(self) -> &'static str {
        match self {
            Self::Integer | Self::Object | Self::Array => "an",
            _ => "a",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        })
    }
}

/// Inclusive numeric bounds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    /// Lower bound (inclusive).
    pub min: f64,
    /// Upper bound (inclusive).
    pub max: f64,
}

impl NumericRange {
    /// Returns `true` if `value` lies within the bounds.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl fmt::Display for NumericRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.min, self.max)
    }
}

/// Declaration of a single response field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    name: String,
    kind: FieldKind,
    range: Option<NumericRange>,
}

impl FieldSpec {
    /// Declares a field of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            range: None,
        }
    }

    /// Parses a compact declaration such as `float[0,1]`.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError::InvalidSchema`] for unknown types, malformed
    /// bounds, or bounds on non-numeric types.
    pub fn parse(name: impl Into<String>, declaration: &str) -> PromptResult<Self> {
        let name = name.into();
        let declaration = declaration.trim().to_ascii_lowercase();
        let invalid = |reason: String| PromptError::InvalidSchema {
            field: name.clone(),
            reason,
        };

        let (base, bounds) = match declaration.split_once('[') {
            Some((base, rest)) => {
                let inner = rest
                    .strip_suffix(']')
                    .ok_or_else(|| invalid(format!("unterminated range in `{declaration}`")))?;
                (base.trim(), Some(inner))
            }
            None => (declaration.as_str(), None),
        };

        let kind = FieldKind::parse(base)
            .ok_or_else(|| invalid(format!("unknown field type `{base}`")))?;

        let range = match bounds {
            None => None,
            Some(_) if !kind.is_numeric() => {
                return Err(invalid(format!("{kind} fields cannot declare a range")));
            }
            Some(inner) => {
                let (min, max) = inner
                    .split_once(',')
                    .ok_or_else(|| invalid(format!("range `[{inner}]` needs two bounds")))?;
                let parse = |bound: &str| {
                    bound
                        .trim()
                        .parse::<f64>()
                        .map_err(|err| invalid(format!("invalid bound `{}`: {err}", bound.trim())))
                };
                let range = NumericRange {
                    min: parse(min)?,
                    max: parse(max)?,
                };
                if range.min > range.max {
                    return Err(invalid(format!("range {range} is empty")));
                }
                Some(range)
            }
        };

        Ok(Self { name, kind, range })
    }

    /// Restricts a numeric field to inclusive bounds.
    #[must_use]
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(NumericRange { min, max });
        self
    }

    /// Returns the field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the expected JSON type.
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Returns the numeric bounds, if any.
    #[must_use]
    pub const fn range(&self) -> Option<NumericRange> {
        self.range
    }

    /// Describes the expectation, e.g. `a number in [0,1]`.
    #[must_use]
    pub fn expectation(&self) -> String {
        match self.range {
            Some(range) => format!("{} {} in {range}", self.kind.article(), self.kind),
            None => format!("{} {}", self.kind.article(), self.kind),
        }
    }
}

/// Expected shape of a model response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    fields: Vec<FieldSpec>,
}

impl ResponseSchema {
    /// Creates a schema from field declarations.
    #[must_use]
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Parses `(name, declaration)` pairs using the compact type syntax.
    ///
    /// # Errors
    ///
    /// Returns the first declaration that fails to parse.
    pub fn parse<I, K, V>(pairs: I) -> PromptResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let fields = pairs
            .into_iter()
            .map(|(name, decl)| FieldSpec::parse(name, decl.as_ref()))
            .collect::<PromptResult<Vec<_>>>()?;
        Ok(Self { fields })
    }

    /// Returns the declared fields in document order.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Returns `true` when no fields are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the field list, e.g. `{"mood": string, "confidence": number in [0,1]}`.
    #[must_use]
    pub fn describe(&self) -> String {
        let fields = self
            .fields
            .iter()
            .map(|field| match field.range {
                Some(range) => format!("\"{}\": {} in {range}", field.name, field.kind),
                None => format!("\"{}\": {}", field.name, field.kind),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{fields}}}")
    }
}
