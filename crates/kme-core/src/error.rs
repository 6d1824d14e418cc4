//! Error types for the KME core

use thiserror::Error;

use crate::identity::KeyId;

/// Errors raised by the key pool and key store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KmeError {
    /// The pool cannot satisfy the requested number of keys at this size
    #[error("Insufficient keys: requested {requested} of {size_bits} bits, {available} obtainable")]
    InsufficientKeys {
        requested: usize,
        available: usize,
        size_bits: usize,
    },

    /// One or more key IDs are unknown or already consumed
    #[error("Key(s) not found: {}", join_ids(.0))]
    KeyNotFound(Vec<KeyId>),

    /// Generating or inserting would push the pool past its capacity
    #[error("Pool capacity exceeded: {current} stored, {requested} requested, capacity {capacity}")]
    CapacityExceeded {
        current: usize,
        requested: usize,
        capacity: usize,
    },

    /// Key size is zero or not a whole number of bytes
    #[error("Invalid key size: {0} bits")]
    InvalidKeySize(usize),

    /// Malformed request input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// SAE identifier is not part of this deployment
    #[error("Unknown SAE: {0}")]
    UnknownSae(String),

    /// A peer KME could not be reached
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    /// Receiver identity hint does not match the recorded association
    #[error("Receiver mismatch for key {key_id}: expected {expected}, got {provided}")]
    ReceiverMismatch {
        key_id: KeyId,
        expected: String,
        provided: String,
    },

    /// Peer request failed authentication
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

fn join_ids(ids: &[KeyId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl KmeError {
    /// Whether a caller may retry the same request later
    ///
    /// `KeyNotFound` is retryable only during the synchronization grace
    /// window; the caller owns the time bound.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KmeError::KeyNotFound(_) | KmeError::PeerUnreachable { .. }
        )
    }

    /// Create an InvalidRequest error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

/// Result type alias for KME core operations
pub type KmeResult<T> = Result<T, KmeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_not_found_lists_ids() {
        let a = KeyId::generate();
        let b = KeyId::generate();
        let err = KmeError::KeyNotFound(vec![a.clone(), b.clone()]);
        let msg = err.to_string();
        assert!(msg.contains(a.as_str()));
        assert!(msg.contains(b.as_str()));
    }

    #[test]
    fn test_retryable() {
        assert!(KmeError::KeyNotFound(vec![]).is_retryable());
        assert!(!KmeError::InvalidKeySize(7).is_retryable());
        assert!(
            !KmeError::InsufficientKeys {
                requested: 2,
                available: 1,
                size_bits: 256
            }
            .is_retryable()
        );
    }
}
