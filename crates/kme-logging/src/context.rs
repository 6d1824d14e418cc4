//! Node identity attached to log output
//!
//! Two KME nodes often share one process in tests and demos. Every node
//! task runs inside the span built here, so each line it logs names the
//! node that produced it.

use kme_core::KmeRole;
use uuid::Uuid;

/// Identity of one running node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContextData {
    /// The node's KME identifier
    pub kme_id: String,
    /// Whether the node generates or mirrors keys
    pub role: KmeRole,
    /// Unique instance ID for this node session
    pub instance_id: Uuid,
}

impl NodeContextData {
    /// Create context for a node with a fresh instance ID
    pub fn new(kme_id: impl Into<String>, role: KmeRole) -> Self {
        Self {
            kme_id: kme_id.into(),
            role,
            instance_id: Uuid::new_v4(),
        }
    }

    /// A span carrying this context as fields
    ///
    /// Async tasks hop between worker threads, so node tasks instrument
    /// themselves with this span.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "kme",
            kme_id = %self.kme_id,
            role = %self.role,
            instance_id = %self.instance_id,
        )
    }
}
