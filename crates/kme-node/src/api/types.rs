//! Wire types for the SAE-facing and peer-facing APIs
//!
//! Field names follow ETSI GS QKD 014 (`key_ID`, `key_IDs`, `source_KME_ID`,
//! ...). Peer messages reuse the same key container.

use kme_core::{Key, KeyBatch, KeyId, KmeResult, SaeId};
use serde::{Deserialize, Serialize};

/// Body (or query) of an encryption key request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncKeysRequest {
    /// Number of keys; defaults to 1
    pub number: Option<usize>,
    /// Key size in bits; defaults to the node's default size
    pub size: Option<usize>,
}

/// One key-ID reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIdRef {
    #[serde(rename = "key_ID")]
    pub key_id: String,
}

/// Body of a decryption key request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecKeysRequest {
    #[serde(rename = "key_IDs", default)]
    pub key_ids: Vec<KeyIdRef>,
}

/// Query of the GET decryption key request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecKeysQuery {
    #[serde(rename = "key_ID")]
    pub key_id: Option<String>,
}

/// A key on the wire: ID plus base64 material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContainer {
    #[serde(rename = "key_ID")]
    pub key_id: String,
    pub key: String,
}

impl KeyContainer {
    /// Decode into a key record
    pub fn to_key(&self) -> KmeResult<Key> {
        Key::from_base64(KeyId::parse(&self.key_id)?, &self.key)
    }
}

impl From<&Key> for KeyContainer {
    fn from(key: &Key) -> Self {
        Self {
            key_id: key.key_id().to_string(),
            key: key.material_base64(),
        }
    }
}

/// Response to an encryption key request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncKeysResponse {
    pub keys: Vec<KeyContainer>,
    pub receiver_sae_id: String,
    pub receiver_email: Option<String>,
    pub sender_email: Option<String>,
}

/// Response to a decryption key request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecKeysResponse {
    pub keys: Vec<KeyContainer>,
}

/// Reachability of one peer as seen by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub kme_id: String,
    pub url: String,
    pub reachable: bool,
    pub consecutive_failures: u32,
    pub pending_removals: usize,
    pub last_error: Option<String>,
}

/// Status of the link between this node and a slave SAE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "source_KME_ID")]
    pub source_kme_id: String,
    #[serde(rename = "target_KME_ID")]
    pub target_kme_id: String,
    #[serde(rename = "master_SAE_ID")]
    pub master_sae_id: String,
    #[serde(rename = "slave_SAE_ID")]
    pub slave_sae_id: String,
    pub key_size: usize,
    pub stored_key_count: usize,
    pub max_key_count: usize,
    pub max_key_per_request: usize,
    pub max_key_size: usize,
    pub min_key_size: usize,
    #[serde(rename = "max_SAE_ID_count")]
    pub max_sae_id_count: usize,

    pub pool_size: usize,
    pub reserved_keys: usize,
    pub consumed_keys: u64,
    pub mirrored_removals: u64,
    pub role: String,
    pub peers: Vec<PeerStatus>,
}

/// Liveness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub kme_id: String,
    pub role: String,
}

/// ETSI error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<serde_json::Value>,
}

/// Keys pushed from one KME to its peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRequest {
    #[serde(rename = "master_SAE_ID")]
    pub master_sae_id: String,
    #[serde(rename = "slave_SAE_ID")]
    pub slave_sae_id: String,
    pub sender_email: Option<String>,
    pub receiver_email: Option<String>,
    pub keys: Vec<KeyContainer>,
}

impl ExchangeRequest {
    /// Build the wire form of a batch
    pub fn from_batch(batch: &KeyBatch) -> Self {
        Self {
            master_sae_id: batch.master_sae_id.to_string(),
            slave_sae_id: batch.slave_sae_id.to_string(),
            sender_email: batch.sender_email.clone(),
            receiver_email: batch.receiver_email.clone(),
            keys: batch.keys.iter().map(KeyContainer::from).collect(),
        }
    }

    /// Decode into a batch, rejecting malformed IDs and material
    pub fn into_batch(self) -> KmeResult<KeyBatch> {
        let keys = self
            .keys
            .iter()
            .map(KeyContainer::to_key)
            .collect::<KmeResult<Vec<_>>>()?;
        Ok(KeyBatch {
            master_sae_id: SaeId::new(self.master_sae_id)?,
            slave_sae_id: SaeId::new(self.slave_sae_id)?,
            sender_email: self.sender_email,
            receiver_email: self.receiver_email,
            keys,
        })
    }
}

/// Removal mirrored from one KME to its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    #[serde(rename = "master_SAE_ID")]
    pub master_sae_id: String,
    #[serde(rename = "slave_SAE_ID")]
    pub slave_sae_id: String,
    #[serde(rename = "key_IDs")]
    pub key_ids: Vec<KeyIdRef>,
}

impl RemoveRequest {
    /// Build the wire form of a removal
    pub fn new(master_sae_id: &SaeId, slave_sae_id: &SaeId, key_ids: &[KeyId]) -> Self {
        Self {
            master_sae_id: master_sae_id.to_string(),
            slave_sae_id: slave_sae_id.to_string(),
            key_ids: key_ids
                .iter()
                .map(|id| KeyIdRef {
                    key_id: id.to_string(),
                })
                .collect(),
        }
    }

    /// Parsed key IDs
    pub fn parsed_ids(&self) -> KmeResult<Vec<KeyId>> {
        self.key_ids.iter().map(|r| KeyId::parse(&r.key_id)).collect()
    }
}

/// Acknowledgement of a peer message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAck {
    pub accepted: usize,
}
