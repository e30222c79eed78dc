//! Validated identifier types shared by every orchestration component.
//!
//! Each identifier is a distinct newtype so that, for example, a `StepId`
//! can never be passed where a `PlanId` is expected. All identifiers share
//! the same validation rules and are parsed, never constructed blindly,
//! except in tests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length for all identifier types.
pub const MAX_ID_LENGTH: usize = 128;

/// Error returned when an identifier string fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    Empty,
    WhitespaceOnly,
    LeadingTrailingWhitespace,
    InvalidCharacters,
    TooLong { length: usize, max: usize },
    PathTraversal,
}

impl fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "identifier cannot be empty"),
            Self::WhitespaceOnly => write!(f, "identifier cannot be whitespace-only"),
            Self::LeadingTrailingWhitespace => {
                write!(f, "identifier cannot have leading or trailing whitespace")
            }
            Self::InvalidCharacters => write!(
                f,
                "identifier can only contain alphanumeric characters, hyphens, underscores, and dots"
            ),
            Self::TooLong { length, max } => {
                write!(f, "identifier too long ({length} chars, max {max})")
            }
            Self::PathTraversal => write!(f, "identifier cannot contain path traversal sequences"),
        }
    }
}

impl std::error::Error for IdValidationError {}

fn validate(id: &str) -> Result<&str, IdValidationError> {
    if id.is_empty() {
        return Err(IdValidationError::Empty);
    }
    if id.trim().is_empty() {
        return Err(IdValidationError::WhitespaceOnly);
    }
    if id != id.trim() {
        return Err(IdValidationError::LeadingTrailingWhitespace);
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(IdValidationError::TooLong {
            length: id.len(),
            max: MAX_ID_LENGTH,
        });
    }
    if id.contains("../") || id.contains("./") {
        return Err(IdValidationError::PathTraversal);
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(IdValidationError::InvalidCharacters);
    }
    Ok(id)
}

macro_rules! id_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse and validate an identifier from a string.
            pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
                validate(id.as_ref()).map(|s| Self(s.to_string()))
            }

            /// Get the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Construct without validation. Only for tests and generated ids
            /// known to already satisfy the validation rules (e.g. UUIDs).
            #[doc(hidden)]
            pub fn new_unchecked(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new identifier from a random UUID v4.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdValidationError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }
    };
}

id_type!(AgentId, "Unique identifier for a registered agent.");
id_type!(PlanId, "Unique identifier for an execution plan.");
id_type!(StepId, "Unique identifier for a step within a plan.");
id_type!(RequestId, "Unique identifier for an originating passage request.");
