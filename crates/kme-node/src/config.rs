//! Configuration for a KME node
//!
//! A node is configured from a TOML file whose tables mirror [`NodeConfig`];
//! every field has a default, so a minimal file only names the node, its
//! SAE and its peers:
//!
//! ```toml
//! kme_id = "KME-A"
//! role = "generator"
//! listen_addr = "0.0.0.0:8001"
//! sae_id = "SAE-A"
//!
//! [[peers]]
//! kme_id = "KME-B"
//! url = "http://kme-b:8002"
//! secret = "shared-peer-secret"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use kme_core::{DEFAULT_POOL_CAPACITY, DEFAULT_REFILL_THRESHOLD, KmeRole, SaeId};
use kme_logging::LogConfig;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

/// Default key size in bits
pub const DEFAULT_KEY_SIZE: usize = 256;

/// Smallest key size served
pub const DEFAULT_MIN_KEY_SIZE: usize = 64;

/// Largest key size served
pub const DEFAULT_MAX_KEY_SIZE: usize = 8192;

/// Most keys handed out by one request
pub const DEFAULT_MAX_KEYS_PER_REQUEST: usize = 128;

/// A peer KME this node replicates with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's KME identifier, sent and checked in `X-KME-ID`
    pub kme_id: String,
    /// Base URL of the peer's API, e.g. `http://kme-b:8002`
    pub url: String,
    /// Secret shared with the peer for request signatures
    pub secret: String,
}

impl PeerConfig {
    /// Create a peer entry
    pub fn new(kme_id: impl Into<String>, url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            kme_id: kme_id.into(),
            url: url.into(),
            secret: secret.into(),
        }
    }

    /// Full URL for a path on this peer
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), path)
    }
}

/// Configuration for a KmeNode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's KME identifier
    pub kme_id: String,
    /// Generator or retriever
    pub role: KmeRole,
    /// Address the HTTP API listens on
    pub listen_addr: SocketAddr,
    /// SAE attached to this node, used when a request has no `X-SAE-ID`
    pub sae_id: String,
    /// SAEs accepted in request paths; empty accepts any
    pub known_saes: Vec<String>,

    /// Maximum number of keys in the pool
    pub pool_capacity: usize,
    /// Pool size below which the refill task tops it up
    pub refill_threshold: usize,
    /// Background refill; `None` follows the role
    pub refill_enabled: Option<bool>,
    /// Refill task period in milliseconds
    pub refill_interval_ms: u64,

    /// Key size used when a request omits `size`
    pub default_key_size: usize,
    /// Smallest key size served
    pub min_key_size: usize,
    /// Largest key size served
    pub max_key_size: usize,
    /// Most keys handed out by one request
    pub max_keys_per_request: usize,

    /// Reject decryption requests whose receiver hint mismatches
    pub strict_receiver_check: bool,

    /// Peers to replicate with
    pub peers: Vec<PeerConfig>,
    /// Per-attempt timeout for peer requests in milliseconds
    pub peer_timeout_ms: u64,
    /// Delivery attempts per peer request
    pub max_attempts: u32,
    /// First retry delay in milliseconds; doubles per attempt
    pub retry_base_ms: u64,
    /// Accepted clock skew for signed peer requests in seconds
    pub auth_max_skew_secs: u64,
    /// Monitor task period in milliseconds
    pub monitor_interval_ms: u64,

    /// Logging setup for the binary
    pub logging: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            kme_id: "KME-1".to_string(),
            role: KmeRole::Generator,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8001)),
            sae_id: "SAE-1".to_string(),
            known_saes: Vec::new(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            refill_threshold: DEFAULT_REFILL_THRESHOLD,
            refill_enabled: None,
            refill_interval_ms: 2_000,
            default_key_size: DEFAULT_KEY_SIZE,
            min_key_size: DEFAULT_MIN_KEY_SIZE,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_keys_per_request: DEFAULT_MAX_KEYS_PER_REQUEST,
            strict_receiver_check: false,
            peers: Vec::new(),
            peer_timeout_ms: 5_000,
            max_attempts: 3,
            retry_base_ms: 200,
            auth_max_skew_secs: 300,
            monitor_interval_ms: 10_000,
            logging: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a configuration for a node with the given identity
    pub fn new(kme_id: impl Into<String>, role: KmeRole, sae_id: impl Into<String>) -> Self {
        Self {
            kme_id: kme_id.into(),
            role,
            sae_id: sae_id.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(raw: &str) -> NodeResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the node cannot run with
    pub fn validate(&self) -> NodeResult<()> {
        if self.kme_id.trim().is_empty() {
            return Err(NodeError::Config("kme_id must not be empty".into()));
        }
        SaeId::new(self.sae_id.as_str())
            .map_err(|e| NodeError::Config(format!("sae_id: {e}")))?;
        if self.pool_capacity == 0 {
            return Err(NodeError::Config("pool_capacity must be positive".into()));
        }
        if self.min_key_size == 0
            || self.min_key_size % 8 != 0
            || self.max_key_size % 8 != 0
            || self.min_key_size > self.max_key_size
        {
            return Err(NodeError::Config(format!(
                "key size range {}..={} must be byte aligned and non-empty",
                self.min_key_size, self.max_key_size
            )));
        }
        if !(self.min_key_size..=self.max_key_size).contains(&self.default_key_size)
            || self.default_key_size % 8 != 0
        {
            return Err(NodeError::Config(format!(
                "default_key_size {} outside {}..={}",
                self.default_key_size, self.min_key_size, self.max_key_size
            )));
        }
        if self.max_keys_per_request == 0 {
            return Err(NodeError::Config("max_keys_per_request must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(NodeError::Config("max_attempts must be at least 1".into()));
        }
        for peer in &self.peers {
            if peer.kme_id == self.kme_id {
                return Err(NodeError::Config(format!(
                    "peer {} has this node's kme_id",
                    peer.kme_id
                )));
            }
            if !peer.url.starts_with("http://") && !peer.url.starts_with("https://") {
                return Err(NodeError::Config(format!(
                    "peer {} url must be http(s): {}",
                    peer.kme_id, peer.url
                )));
            }
            if peer.secret.is_empty() {
                return Err(NodeError::Config(format!("peer {} has an empty secret", peer.kme_id)));
            }
        }
        Ok(())
    }

    /// Whether the background refill task runs
    pub fn refill_enabled(&self) -> bool {
        self.refill_enabled
            .unwrap_or_else(|| self.role.refills_by_default())
    }

    /// Refill task period
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    /// Monitor task period
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Per-attempt peer request timeout
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// First retry delay for peer requests
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    /// Accepted clock skew for signed peer requests
    pub fn auth_max_skew(&self) -> Duration {
        Duration::from_secs(self.auth_max_skew_secs)
    }

    /// Set the listen address
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Add a peer
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Set the SAEs accepted in request paths
    pub fn with_known_saes(mut self, saes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.known_saes = saes.into_iter().map(Into::into).collect();
        self
    }

    /// Set pool capacity and refill threshold
    pub fn with_pool(mut self, capacity: usize, refill_threshold: usize) -> Self {
        self.pool_capacity = capacity;
        self.refill_threshold = refill_threshold;
        self
    }

    /// Force background refill on or off
    pub fn with_refill(mut self, enabled: bool) -> Self {
        self.refill_enabled = Some(enabled);
        self
    }

    /// Set the refill task period
    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the monitor task period
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set peer retry behaviour
    pub fn with_peer_retry(mut self, max_attempts: u32, retry_base: Duration, timeout: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_base_ms = retry_base.as_millis() as u64;
        self.peer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Reject mismatched receiver hints instead of only logging them
    pub fn with_strict_receiver_check(mut self, strict: bool) -> Self {
        self.strict_receiver_check = strict;
        self
    }
}
