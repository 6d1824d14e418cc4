//! In-memory replication for tests
//!
//! [`MockSync`] records every call the store makes and, when linked to a
//! peer [`KeyStore`], applies the traffic to that store directly. A
//! partitioned mock holds traffic until [`MockSync::deliver_pending`] is
//! called, which lets tests observe the window between a local change and
//! its arrival at the peer.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kme_core::{KeyPool, KeyStore, MockSync, SaeId};
//!
//! let to_retriever = Arc::new(MockSync::new());
//! let generator = KeyStore::new(KeyPool::new(10, 0), to_retriever.clone());
//! let retriever = Arc::new(KeyStore::standalone(KeyPool::new(10, 0)));
//! to_retriever.link(&retriever);
//!
//! let (a, b) = (SaeId::new("A").unwrap(), SaeId::new("B").unwrap());
//! let keys = generator.get_new_key(1, 256, false).unwrap();
//! generator.append_keys(&a, &b, keys.clone(), None, None, true).unwrap();
//! assert!(retriever.contains(keys[0].key_id()));
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::identity::{KeyId, SaeId};
use crate::store::KeyStore;
use crate::sync::{KeyBatch, KeySync};

/// A replication call observed by [`MockSync`]
#[derive(Debug, Clone)]
pub enum SyncCall {
    /// Keys sent to peers
    SendKeys(KeyBatch),
    /// Removal mirrored to peers
    RemoveKeys {
        master_sae_id: SaeId,
        slave_sae_id: SaeId,
        key_ids: Vec<KeyId>,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<SyncCall>,
    pending: VecDeque<SyncCall>,
    partitioned: bool,
}

/// Recording [`KeySync`] with optional direct delivery to a peer store
#[derive(Default)]
pub struct MockSync {
    state: Mutex<MockState>,
    peer: Mutex<Option<Weak<KeyStore>>>,
}

impl MockSync {
    /// Create an unlinked mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver future traffic to `peer`
    pub fn link(&self, peer: &Arc<KeyStore>) {
        *self.peer.lock() = Some(Arc::downgrade(peer));
    }

    /// Hold traffic instead of delivering it
    pub fn set_partitioned(&self, partitioned: bool) {
        self.state.lock().partitioned = partitioned;
    }

    /// Every call recorded so far
    pub fn calls(&self) -> Vec<SyncCall> {
        self.state.lock().calls.clone()
    }

    /// Number of held calls
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Deliver every held call to the linked peer
    ///
    /// Returns the number of calls delivered.
    pub fn deliver_pending(&self) -> usize {
        let drained: Vec<SyncCall> = self.state.lock().pending.drain(..).collect();
        let count = drained.len();
        for call in drained {
            self.deliver(call);
        }
        count
    }

    fn record(&self, call: SyncCall) {
        let hold = {
            let mut state = self.state.lock();
            state.calls.push(call.clone());
            if state.partitioned {
                state.pending.push_back(call.clone());
            }
            state.partitioned
        };
        if !hold {
            self.deliver(call);
        }
    }

    fn deliver(&self, call: SyncCall) {
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        let Some(peer) = peer else {
            return;
        };
        match call {
            SyncCall::SendKeys(batch) => {
                if let Err(e) = peer.apply_peer_keys(&batch) {
                    debug!(error = %e, "Mock delivery of keys rejected by peer");
                }
            }
            SyncCall::RemoveKeys { key_ids, .. } => {
                peer.apply_peer_removal(&key_ids);
            }
        }
    }
}

impl KeySync for MockSync {
    fn send_keys(&self, batch: KeyBatch) {
        self.record(SyncCall::SendKeys(batch));
    }

    fn remove_keys(&self, master_sae_id: &SaeId, slave_sae_id: &SaeId, key_ids: Vec<KeyId>) {
        self.record(SyncCall::RemoveKeys {
            master_sae_id: master_sae_id.clone(),
            slave_sae_id: slave_sae_id.clone(),
            key_ids,
        });
    }
}
