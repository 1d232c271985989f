//! Session and prompt identifier types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

const MAX_PROMPT_ID_LEN: usize = 128;

/// Opaque token identifying one logical conversation.
///
/// The token is shared with the caller, which echoes it back on later turns.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a random session identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an identifier from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s.trim()).map_err(Error::from)?;
        Ok(Self::from_uuid(uuid))
    }
}

/// Identifier of a prompt definition, usually the route key it serves (`mood/json`).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PromptSpecId(String);

impl PromptSpecId {
    /// Creates a prompt identifier after validating its format.
    ///
    /// Identifiers are case-folded to lower case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPromptId`] if the identifier is empty, too long,
    /// or contains unsupported characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_ascii_lowercase();
        validate_prompt_id(&id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PromptSpecId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PromptSpecId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PromptSpecId {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PromptSpecId> for String {
    fn from(value: PromptSpecId) -> Self {
        value.0
    }
}

fn validate_prompt_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidPromptId {
            id: String::new(),
            reason: "identifier cannot be empty".into(),
        });
    }

    if id.len() > MAX_PROMPT_ID_LEN {
        return Err(Error::InvalidPromptId {
            id: id.into(),
            reason: format!("identifier length must be <= {MAX_PROMPT_ID_LEN}"),
        });
    }

    if !id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '/'))
    {
        return Err(Error::InvalidPromptId {
            id: id.into(),
            reason: "identifier must contain alphanumeric, dash, underscore, dot, or slash".into(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_session_id() {
        let id = SessionId::random();
        let parsed = id.to_string().parse::<SessionId>().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_garbage_session_id() {
        let err = "not-a-session".parse::<SessionId>().expect_err("should fail");
        assert!(matches!(err, Error::InvalidSessionId { .. }));
    }

    #[test]
    fn prompt_id_is_case_folded() {
        let id = PromptSpecId::new(" Mood/JSON ").expect("id");
        assert_eq!(id.as_str(), "mood/json");
    }

    #[test]
    fn prompt_id_rejects_spaces() {
        let err = PromptSpecId::new("mood json").expect_err("should fail");
        assert!(matches!(err, Error::InvalidPromptId { .. }));
    }

    #[test]
    fn prompt_id_deserializes_with_validation() {
        let id: PromptSpecId = serde_json::from_str("\"calc/add\"").expect("valid");
        assert_eq!(id.as_str(), "calc/add");
        assert!(serde_json::from_str::<PromptSpecId>("\"\"").is_err());
    }
}
