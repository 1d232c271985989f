use std::fmt::Write;

use lean_prompts::ResponseSchema;

use crate::validator::FieldError;

/// Builds the corrective message sent as a delta after a failed validation.
///
/// Every field error is quoted verbatim so the model sees exactly what to fix.
#[must_use]
pub fn corrective_instruction(errors: &[FieldError], schema: Option<&ResponseSchema>) -> String {
    let mut message = String::from("Validation Error:");
    for error in errors {
        let _ = write!(message, "\n- {error}");
    }
    message.push_str("\nPlease correct your response to match the required schema.");
    if let Some(schema) = schema.filter(|schema| !schema.is_empty()) {
        let _ = write!(
            message,
            " Reply with a single JSON object of the form {} and nothing else.",
            schema.describe()
        );
    }
    message
}
