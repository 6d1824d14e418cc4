//! Identifiers used across the KME
//!
//! - [`KeyId`]: unique identifier of one key record (UUID v4, the ETSI `key_ID`)
//! - [`SaeId`]: stable identifier of a Secure Application Entity
//! - [`KmeRole`]: whether a node generates stock or only mirrors it

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KmeError;

/// Unique identifier of a key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(String);

impl KeyId {
    /// Generate a fresh random key ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse and normalize a key ID received from the wire
    pub fn parse(s: &str) -> Result<Self, KmeError> {
        let uuid = Uuid::parse_str(s.trim())
            .map_err(|e| KmeError::invalid(format!("malformed key_ID {s:?}: {e}")))?;
        Ok(Self(uuid.hyphenated().to_string()))
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines
    pub fn short_id(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for KeyId {
    type Err = KmeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for KeyId {
    type Error = KmeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

/// Secure Application Entity identifier
///
/// Static per deployment; never generated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SaeId(String);

impl SaeId {
    /// Create an SAE ID, rejecting empty or whitespace-only input
    pub fn new(id: impl Into<String>) -> Result<Self, KmeError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(KmeError::invalid("SAE ID must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SaeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SaeId {
    type Err = KmeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SaeId {
    type Error = KmeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SaeId> for String {
    fn from(id: SaeId) -> Self {
        id.0
    }
}

/// Role of a KME node in the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KmeRole {
    /// Keeps its pool stocked and hands out encryption keys
    #[default]
    Generator,
    /// Holds mirrored keys for the decrypting side
    Retriever,
}

impl KmeRole {
    /// Whether background refill is on by default for this role
    pub fn refills_by_default(&self) -> bool {
        matches!(self, KmeRole::Generator)
    }
}

impl Display for KmeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KmeRole::Generator => write!(f, "generator"),
            KmeRole::Retriever => write!(f, "retriever"),
        }
    }
}

impl FromStr for KmeRole {
    type Err = KmeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generator" => Ok(KmeRole::Generator),
            "retriever" => Ok(KmeRole::Retriever),
            other => Err(KmeError::invalid(format!("unknown role: {other}"))),
        }
    }
}
