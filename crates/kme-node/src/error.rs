//! Error types for the KME node

use kme_core::KmeError;
use thiserror::Error;

/// Errors that can occur in the node, its tasks and its client
#[derive(Debug, Error)]
pub enum NodeError {
    /// Key store or request validation error
    #[error(transparent)]
    Key(#[from] KmeError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success response from a KME
    #[error("KME responded {status}: {message}")]
    Api { status: u16, message: String },

    /// Node not started
    #[error("Node not started")]
    NotStarted,

    /// Node already started
    #[error("Node already started")]
    AlreadyStarted,

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl NodeError {
    /// The underlying key error, if this is one
    pub fn as_key_error(&self) -> Option<&KmeError> {
        match self {
            NodeError::Key(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        NodeError::Http(e.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(e: toml::de::Error) -> Self {
        NodeError::Config(e.to_string())
    }
}

/// Result type alias for node operations
pub type NodeResult<T> = Result<T, NodeError>;
