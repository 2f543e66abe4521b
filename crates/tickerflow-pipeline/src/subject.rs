//! Ticker normalisation

use crate::error::ValidationError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Normalised ticker a session pertains to
///
/// Always uppercase, 1 to [`Subject::MAX_LEN`] characters drawn from
/// `A-Z 0-9 . - ^ =`, with at least one letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    /// Longest accepted ticker
    pub const MAX_LEN: usize = 12;

    /// Validate and normalise raw user input
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            return Err(ValidationError::EmptySubject);
        }

        let invalid = |reason: String| ValidationError::InvalidSubject {
            subject: raw.trim().to_string(),
            reason,
        };

        if normalized.chars().count() > Self::MAX_LEN {
            return Err(invalid(format!("longer than {} characters", Self::MAX_LEN)));
        }

        if let Some(bad) = normalized
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '=')))
        {
            return Err(invalid(format!("unsupported character '{bad}'")));
        }

        if !normalized.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("no letters or digits".to_string()));
        }

        Ok(Self(normalized))
    }

    /// The ticker as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Subject {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
