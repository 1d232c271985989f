//! Guardrails for structured model output.
//!
//! [`validate`] checks a raw response against a [`ResponseSchema`] and reports
//! every offending field. [`corrective_instruction`] turns those reports into the
//! follow-up message sent back to the model. Nothing here performs I/O.
//!
//! [`ResponseSchema`]: lean_prompts::ResponseSchema

#![warn(missing_docs, clippy::pedantic)]

mod correction;
mod validator;

pub use correction::corrective_instruction;
pub use validator::{FieldError, FieldProblem, ROOT_FIELD, ValidationResult, validate};
