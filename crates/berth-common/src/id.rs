//! Container ID generation and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BerthError, BerthResult};

/// A validated, full length container ID.
///
/// Container IDs are 64 lowercase hexadecimal characters. The first
/// [`ContainerId::SHORT_LENGTH`] characters form the short id shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Length of a full container ID.
    pub const FULL_LENGTH: usize = 64;

    /// Length of the truncated form.
    pub const SHORT_LENGTH: usize = 12;

    /// Create a container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error unless `id` is 64 lowercase hex characters.
    pub fn new(id: impl Into<String>) -> BerthResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random container ID from two UUID v4 values.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self(hex::encode(bytes))
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> BerthResult<()> {
        let well_formed = id.len() == Self::FULL_LENGTH
            && id
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if well_formed {
            Ok(())
        } else {
            Err(BerthError::InvalidContainerId { id: id.to_string() })
        }
    }

    /// Returns the short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        truncate_id(&self.0)
    }
}

/// Truncate any id-like string to its short form.
#[must_use]
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(ContainerId::SHORT_LENGTH) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = BerthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
