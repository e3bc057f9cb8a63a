//! Job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

const MAX_ID_LEN: usize = 128;

/// Identifier of a queued job.
///
/// Either supplied by the caller (e.g. a draft id) or generated as a
/// time-ordered UUIDv7. Ids are used inside storage keys, so they must be
/// non-empty, bounded and free of whitespace and `/`. Deserialized ids go
/// through the same checks as [`JobId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Generate a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing ids explicitly in tests
    /// for determinism.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Build an identifier from caller-supplied text.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ValidationError::invalid_id("id must not be empty"));
        }
        if raw.len() > MAX_ID_LEN {
            return Err(ValidationError::invalid_id(format!(
                "id longer than {MAX_ID_LEN} bytes"
            )));
        }
        if raw.chars().any(|c| c == '/' || c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::invalid_id(format!(
                "{raw:?} contains '/', whitespace or control characters"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
