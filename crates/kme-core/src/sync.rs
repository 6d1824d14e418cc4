//! Replication seam between a [`KeyStore`](crate::KeyStore) and its peers
//!
//! The store calls [`KeySync`] after releasing its lock. Implementations
//! must return promptly: replication is fire-and-forget relative to the
//! caller, and failures are the implementation's to log.

use crate::identity::{KeyId, SaeId};
use crate::key::Key;
use crate::store::EmailAssociation;

/// A batch of keys to replicate, with the association they were issued under
#[derive(Debug, Clone)]
pub struct KeyBatch {
    /// SAE on the encrypting side
    pub master_sae_id: SaeId,
    /// SAE on the decrypting side
    pub slave_sae_id: SaeId,
    /// Sender identity hint, if one was supplied
    pub sender_email: Option<String>,
    /// Receiver identity hint, if one was supplied
    pub receiver_email: Option<String>,
    /// The keys themselves
    pub keys: Vec<Key>,
}

impl KeyBatch {
    /// Build the association recorded for every key in the batch
    pub fn association(&self) -> EmailAssociation {
        EmailAssociation {
            master_sae_id: self.master_sae_id.clone(),
            slave_sae_id: self.slave_sae_id.clone(),
            sender_email: self.sender_email.clone(),
            receiver_email: self.receiver_email.clone(),
        }
    }

    /// IDs of the keys in the batch
    pub fn key_ids(&self) -> Vec<KeyId> {
        self.keys.iter().map(|k| k.key_id().clone()).collect()
    }
}

/// Outbound replication of key additions and removals
pub trait KeySync: Send + Sync {
    /// Deliver newly issued keys to every peer
    fn send_keys(&self, batch: KeyBatch);

    /// Mirror the retirement of keys to every peer
    fn remove_keys(&self, master_sae_id: &SaeId, slave_sae_id: &SaeId, key_ids: Vec<KeyId>);
}

/// Replication that goes nowhere, for single-node use
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSync;

impl KeySync for NoopSync {
    fn send_keys(&self, _batch: KeyBatch) {}

    fn remove_keys(&self, _master_sae_id: &SaeId, _slave_sae_id: &SaeId, _key_ids: Vec<KeyId>) {}
}
