//! Key store: a [`KeyPool`] plus per-identity bookkeeping
//!
//! Every mutation of the pool, the association map and the reservation set
//! happens under one mutex, so a read-check-mutate sequence such as "is this
//! key present, then remove it" cannot interleave with another request. The
//! replication seam is invoked only after the guard is dropped.
//!
//! ## Reservation
//!
//! The encryption path hands out copies of keys that stay in the pool until
//! the decrypting side consumes them. Such keys are *reserved* so they are
//! never handed out twice for encryption. Keys mirrored from a peer arrive
//! reserved for the same reason.
//!
//! ## Retired IDs
//!
//! The store remembers the IDs it retired. A key batch that names one of them
//! (a peer retrying an exchange it already delivered, or a replayed request)
//! cannot bring the key back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{KmeError, KmeResult};
use crate::identity::{KeyId, SaeId};
use crate::key::{Key, validate_size};
use crate::pool::KeyPool;
use crate::sync::{KeyBatch, KeySync, NoopSync};
use crate::verify::{ReceiverCheck, check_receiver};

/// Who a key was issued for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAssociation {
    /// SAE on the encrypting side
    pub master_sae_id: SaeId,
    /// SAE on the decrypting side
    pub slave_sae_id: SaeId,
    /// Sender identity hint
    pub sender_email: Option<String>,
    /// Receiver identity hint
    pub receiver_email: Option<String>,
}

/// Point-in-time counters for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Keys currently in the pool
    pub pool_size: usize,
    /// Pool capacity
    pub capacity: usize,
    /// Keys handed out or mirrored and awaiting consumption
    pub reserved_keys: usize,
    /// Keys retired by a destructive read on this node
    pub consumed_keys: u64,
    /// Keys retired because a peer consumed them
    pub mirrored_removals: u64,
    /// Keys generated locally over the node's lifetime
    pub generated_keys: u64,
}

/// Number of retired IDs remembered; the oldest are forgotten first
pub const RETIRED_ID_MEMORY: usize = 100_000;

/// Bounded memory of retired key IDs
#[derive(Debug)]
struct RetiredIds {
    ids: HashSet<KeyId>,
    order: VecDeque<KeyId>,
    limit: usize,
}

impl RetiredIds {
    fn new(limit: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    fn insert(&mut self, key_id: &KeyId) {
        if !self.ids.insert(key_id.clone()) {
            return;
        }
        self.order.push_back(key_id.clone());
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, key_id: &KeyId) -> bool {
        self.ids.contains(key_id)
    }
}

#[derive(Debug)]
struct StoreInner {
    pool: KeyPool,
    associations: HashMap<KeyId, EmailAssociation>,
    reserved: HashSet<KeyId>,
    retired: RetiredIds,
    consumed: u64,
    mirrored_removals: u64,
}

impl StoreInner {
    /// Drop a key and its bookkeeping; `None` if it was already gone
    ///
    /// The ID is remembered as retired either way.
    fn retire(&mut self, key_id: &KeyId) -> Option<Key> {
        self.retired.insert(key_id);
        let key = self.pool.get_key(key_id, true).ok()?;
        self.associations.remove(key_id);
        self.reserved.remove(key_id);
        Some(key)
    }

    /// Unreserved keys accepted by `filter`, oldest first
    fn unreserved(&self, limit: usize, filter: impl Fn(&Key) -> bool) -> Vec<KeyId> {
        self.pool
            .iter()
            .filter(|k| !self.reserved.contains(k.key_id()) && filter(k))
            .take(limit)
            .map(|k| k.key_id().clone())
            .collect()
    }
}

/// Lock-guarded key pool with association tracking and peer replication
pub struct KeyStore {
    inner: Mutex<StoreInner>,
    sync: Arc<dyn KeySync>,
}

impl KeyStore {
    /// Create a store over `pool` replicating through `sync`
    pub fn new(pool: KeyPool, sync: Arc<dyn KeySync>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                pool,
                associations: HashMap::new(),
                reserved: HashSet::new(),
                retired: RetiredIds::new(RETIRED_ID_MEMORY),
                consumed: 0,
                mirrored_removals: 0,
            }),
            sync,
        }
    }

    /// Create a store that does not replicate
    pub fn standalone(pool: KeyPool) -> Self {
        Self::new(pool, Arc::new(NoopSync))
    }

    /// Insert keys, record their association and optionally replicate them
    ///
    /// Keys already in the pool (handed out by [`get_new_key`](Self::get_new_key))
    /// are not inserted twice. Replication failures never surface here.
    pub fn append_keys(
        &self,
        master_sae_id: &SaeId,
        slave_sae_id: &SaeId,
        keys: Vec<Key>,
        sender_email: Option<String>,
        receiver_email: Option<String>,
        broadcast: bool,
    ) -> KmeResult<usize> {
        let batch = KeyBatch {
            master_sae_id: master_sae_id.clone(),
            slave_sae_id: slave_sae_id.clone(),
            sender_email,
            receiver_email,
            keys,
        };
        let added = self.record_batch(&batch)?;

        if broadcast && !batch.keys.is_empty() {
            self.sync.send_keys(batch);
        }
        Ok(added)
    }

    /// Apply keys a peer replicated to us
    pub fn apply_peer_keys(&self, batch: &KeyBatch) -> KmeResult<usize> {
        let added = self.record_batch(batch)?;
        info!(
            count = batch.keys.len(),
            added,
            master = %batch.master_sae_id,
            slave = %batch.slave_sae_id,
            "Applied keys from peer"
        );
        Ok(added)
    }

    fn record_batch(&self, batch: &KeyBatch) -> KmeResult<usize> {
        let association = batch.association();
        let mut inner = self.inner.lock();

        let (retired, live): (Vec<&Key>, Vec<&Key>) = batch
            .keys
            .iter()
            .partition(|k| inner.retired.contains(k.key_id()));
        if !retired.is_empty() {
            warn!(
                count = retired.len(),
                master = %batch.master_sae_id,
                "Ignoring keys that were already retired"
            );
        }

        let added = inner.pool.insert(live.iter().map(|k| (*k).clone()).collect())?;

        for key in &live {
            inner
                .associations
                .insert(key.key_id().clone(), association.clone());
            inner.reserved.insert(key.key_id().clone());
        }
        debug!(count = live.len(), added, "Recorded key association");
        Ok(added)
    }

    /// Obtain `count` keys of `size_bits`
    ///
    /// With `remove = false` (encryption path) the keys are copies: they stay
    /// in the pool, reserved, until the decrypting side consumes them. Missing
    /// stock is generated on demand. When the pool is full, unreserved stock
    /// of other sizes is evicted, oldest first, to make room. If that still
    /// cannot cover the shortfall the call fails with `InsufficientKeys` and
    /// changes nothing.
    ///
    /// With `remove = true` unreserved stock is taken out of the pool and
    /// nothing is generated.
    pub fn get_new_key(&self, count: usize, size_bits: usize, remove: bool) -> KmeResult<Vec<Key>> {
        if count == 0 {
            return Err(KmeError::invalid("number of keys must be at least 1"));
        }
        validate_size(size_bits)?;

        let mut inner = self.inner.lock();
        let candidates = inner.unreserved(count, |k| k.size_bits() == size_bits);

        if remove {
            if candidates.len() < count {
                return Err(KmeError::InsufficientKeys {
                    requested: count,
                    available: candidates.len(),
                    size_bits,
                });
            }
            let mut taken = Vec::with_capacity(count);
            for id in &candidates {
                let key = inner
                    .retire(id)
                    .ok_or_else(|| KmeError::KeyNotFound(vec![id.clone()]))?;
                taken.push(key);
            }
            return Ok(taken);
        }

        let shortfall = count - candidates.len();
        let headroom = inner.pool.available();
        let evictable = if shortfall > headroom {
            inner.unreserved(shortfall - headroom, |k| k.size_bits() != size_bits)
        } else {
            Vec::new()
        };
        if shortfall > headroom + evictable.len() {
            return Err(KmeError::InsufficientKeys {
                requested: count,
                available: candidates.len() + headroom + evictable.len(),
                size_bits,
            });
        }
        if !evictable.is_empty() {
            for id in &evictable {
                inner.pool.get_key(id, true)?;
            }
            debug!(evicted = evictable.len(), size_bits, "Evicted idle stock of other sizes");
        }

        let mut keys = Vec::with_capacity(count);
        for id in &candidates {
            keys.push(inner.pool.get_key(id, false)?);
        }
        if shortfall > 0 {
            keys.extend(inner.pool.generate_batch(shortfall, size_bits)?);
        }
        for key in &keys {
            inner.reserved.insert(key.key_id().clone());
        }
        Ok(keys)
    }

    /// Fetch keys by ID, all or nothing
    ///
    /// If any ID is absent the call fails with `KeyNotFound` naming every
    /// missing ID and the pool is left untouched. With `remove = true` the
    /// keys are retired: taken from the pool, their association dropped and
    /// the consumed counter advanced. Repeated IDs collapse to one.
    pub fn get_keys_by_id(&self, key_ids: &[KeyId], remove: bool) -> KmeResult<Vec<Key>> {
        let mut seen = HashSet::new();
        let ids: Vec<&KeyId> = key_ids.iter().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Err(KmeError::invalid("at least one key_ID is required"));
        }

        let mut inner = self.inner.lock();
        let missing: Vec<KeyId> = ids
            .iter()
            .filter(|id| !inner.pool.contains(id))
            .map(|id| (*id).clone())
            .collect();
        if !missing.is_empty() {
            return Err(KmeError::KeyNotFound(missing));
        }

        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            if remove {
                let key = inner
                    .retire(id)
                    .ok_or_else(|| KmeError::KeyNotFound(vec![id.clone()]))?;
                inner.consumed += 1;
                keys.push(key);
            } else {
                keys.push(inner.pool.get_key(id, false)?);
            }
        }
        Ok(keys)
    }

    /// Retire keys locally and mirror the removal to peers
    ///
    /// IDs that are already gone are logged and skipped. Returns how many
    /// keys this call removed locally.
    pub fn remove_keys(
        &self,
        master_sae_id: &SaeId,
        slave_sae_id: &SaeId,
        key_ids: &[KeyId],
    ) -> usize {
        let removed = {
            let mut inner = self.inner.lock();
            let mut removed = 0;
            for id in key_ids {
                if inner.retire(id).is_some() {
                    removed += 1;
                } else {
                    debug!(key_id = %id, "Key already retired locally");
                }
            }
            removed
        };

        if !key_ids.is_empty() {
            self.sync
                .remove_keys(master_sae_id, slave_sae_id, key_ids.to_vec());
        }
        removed
    }

    /// Mirror the removal of keys this node already retired
    ///
    /// Used after a destructive [`get_keys_by_id`](Self::get_keys_by_id),
    /// which has done the local half.
    pub fn mirror_removal(&self, master_sae_id: &SaeId, slave_sae_id: &SaeId, key_ids: &[KeyId]) {
        if key_ids.is_empty() {
            return;
        }
        self.sync
            .remove_keys(master_sae_id, slave_sae_id, key_ids.to_vec());
    }

    /// Apply a removal a peer mirrored to us
    ///
    /// IDs not held here are still remembered as retired, so keys whose
    /// removal overtook their delivery never become retrievable.
    pub fn apply_peer_removal(&self, key_ids: &[KeyId]) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for id in key_ids {
            if inner.retire(id).is_some() {
                removed += 1;
            }
        }
        inner.mirrored_removals += removed as u64;
        drop(inner);

        if removed < key_ids.len() {
            warn!(
                requested = key_ids.len(),
                removed,
                "Peer removal referenced keys not held here"
            );
        }
        removed
    }

    /// Look up who a key was issued for
    pub fn get_key_email_info(&self, key_id: &KeyId) -> Option<EmailAssociation> {
        self.inner.lock().associations.get(key_id).cloned()
    }

    /// Compare a receiver hint against the key's recorded association
    pub fn verify_receiver(&self, key_id: &KeyId, provided: Option<&str>) -> ReceiverCheck {
        let association = self.get_key_email_info(key_id);
        check_receiver(association.as_ref(), provided)
    }

    /// Top the pool back up to capacity if it fell below the threshold
    ///
    /// Key material is generated without holding the lock. Returns the number
    /// of keys added, which is less than generated if requests filled the
    /// pool in the meantime.
    pub fn refill(&self, size_bits: usize) -> KmeResult<usize> {
        validate_size(size_bits)?;
        let deficit = {
            let inner = self.inner.lock();
            if !inner.pool.needs_refill() {
                return Ok(0);
            }
            inner.pool.available()
        };

        let fresh = (0..deficit)
            .map(|_| Key::generate(size_bits))
            .collect::<KmeResult<Vec<_>>>()?;
        Ok(self.inner.lock().pool.absorb_generated(fresh))
    }

    /// Whether a key is currently held
    pub fn contains(&self, key_id: &KeyId) -> bool {
        self.inner.lock().pool.contains(key_id)
    }

    /// Whether a key is reserved
    pub fn is_reserved(&self, key_id: &KeyId) -> bool {
        self.inner.lock().reserved.contains(key_id)
    }

    /// Number of keys in the pool
    pub fn size(&self) -> usize {
        self.inner.lock().pool.size()
    }

    /// Snapshot of the store's counters
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            pool_size: inner.pool.size(),
            capacity: inner.pool.capacity(),
            reserved_keys: inner.reserved.len(),
            consumed_keys: inner.consumed,
            mirrored_removals: inner.mirrored_removals,
            generated_keys: inner.pool.generated_total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_sync::{MockSync, SyncCall};

    fn sae(s: &str) -> SaeId {
        SaeId::new(s).unwrap()
    }

    fn store_with_mock(capacity: usize) -> (KeyStore, Arc<MockSync>) {
        let sync = Arc::new(MockSync::new());
        let store = KeyStore::new(KeyPool::new(capacity, capacity), sync.clone());
        (store, sync)
    }

    #[test]
    fn test_enc_path_is_non_destructive() {
        let (store, _sync) = store_with_mock(10);
        let keys = store.get_new_key(3, 256, false).unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(store.size(), 3);

        store
            .append_keys(
                &sae("A"),
                &sae("B"),
                keys.clone(),
                Some("alice@x".into()),
                Some("bob@x".into()),
                true,
            )
            .unwrap();

        // Pool did not shrink, association map gained one entry per key
        assert_eq!(store.size(), 3);
        for key in &keys {
            let info = store.get_key_email_info(key.key_id()).unwrap();
            assert_eq!(info.receiver_email.as_deref(), Some("bob@x"));
            assert_eq!(info.slave_sae_id, sae("B"));
        }
        assert_eq!(store.stats().reserved_keys, 3);
    }

    #[test]
    fn test_enc_path_never_reissues_reserved_keys() {
        let (store, _sync) = store_with_mock(10);
        let stock = store.get_new_key(2, 256, true);
        // Empty pool: destructive path generates nothing
        assert!(matches!(stock, Err(KmeError::InsufficientKeys { available: 0, .. })));

        store.refill(256).unwrap();
        let first = store.get_new_key(4, 256, false).unwrap();
        let second = store.get_new_key(4, 256, false).unwrap();
        for key in &second {
            assert!(first.iter().all(|k| k.key_id() != key.key_id()));
        }
    }

    #[test]
    fn test_enc_path_insufficient_keys() {
        let (store, _sync) = store_with_mock(4);
        store.get_new_key(3, 256, false).unwrap();

        let err = store.get_new_key(2, 256, false).unwrap_err();
        assert_eq!(
            err,
            KmeError::InsufficientKeys {
                requested: 2,
                available: 1,
                size_bits: 256
            }
        );
        // Nothing reserved by the failed call
        assert_eq!(store.stats().reserved_keys, 3);
        assert_eq!(store.size(), 3);
    }

    #[test]
    fn test_enc_path_matches_size() {
        let (store, _sync) = store_with_mock(10);
        store.refill(128).unwrap();
        assert_eq!(store.size(), 10);

        // Full of 128-bit stock: idle stock makes room for another size
        let wide = store.get_new_key(1, 256, false).unwrap();
        assert_eq!(wide[0].size_bits(), 256);
        assert_eq!(store.size(), 10);

        let keys = store.get_new_key(2, 128, false).unwrap();
        assert!(keys.iter().all(|k| k.size_bits() == 128));
        assert_eq!(store.stats().reserved_keys, 3);
    }

    #[test]
    fn test_refilled_generator_serves_other_sizes() {
        let store = KeyStore::standalone(KeyPool::new(1000, 250));
        assert_eq!(store.refill(256).unwrap(), 1000);

        let keys = store.get_new_key(3, 512, false).unwrap();
        assert!(keys.iter().all(|k| k.size_bits() == 512));
        assert_eq!(store.size(), 1000);
        assert_eq!(store.stats().reserved_keys, 3);
    }

    #[test]
    fn test_eviction_never_touches_reserved_keys() {
        let (store, _sync) = store_with_mock(4);
        let issued = store.get_new_key(3, 128, false).unwrap();
        store.get_new_key(1, 64, false).unwrap();

        // Every key is reserved, so there is nothing to evict
        let err = store.get_new_key(1, 256, false).unwrap_err();
        assert_eq!(
            err,
            KmeError::InsufficientKeys {
                requested: 1,
                available: 0,
                size_bits: 256
            }
        );
        assert!(issued.iter().all(|k| store.contains(k.key_id())));
        assert_eq!(store.size(), 4);
    }

    #[test]
    fn test_append_broadcasts_only_when_asked() {
        let (store, sync) = store_with_mock(10);
        let keys = store.get_new_key(1, 256, false).unwrap();

        store
            .append_keys(&sae("A"), &sae("B"), keys.clone(), None, None, false)
            .unwrap();
        assert!(sync.calls().is_empty());

        store
            .append_keys(&sae("A"), &sae("B"), keys.clone(), None, None, true)
            .unwrap();
        let calls = sync.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], SyncCall::SendKeys(batch) if batch.key_ids() == vec![keys[0].key_id().clone()]));
    }

    #[test]
    fn test_dec_path_one_time_use() {
        let (store, _sync) = store_with_mock(10);
        let keys = store.get_new_key(1, 256, false).unwrap();
        let id = keys[0].key_id().clone();
        store
            .append_keys(&sae("A"), &sae("B"), keys.clone(), None, Some("bob@x".into()), false)
            .unwrap();

        let got = store.get_keys_by_id(&[id.clone()], true).unwrap();
        assert_eq!(got[0], keys[0]);
        assert!(store.get_key_email_info(&id).is_none());
        assert!(!store.is_reserved(&id));

        assert_eq!(
            store.get_keys_by_id(&[id.clone()], true),
            Err(KmeError::KeyNotFound(vec![id]))
        );
        assert_eq!(store.stats().consumed_keys, 1);
    }

    #[test]
    fn test_dec_path_all_or_nothing() {
        let (store, _sync) = store_with_mock(10);
        let keys = store.get_new_key(2, 256, false).unwrap();
        let unknown = KeyId::generate();

        let ids = vec![
            keys[0].key_id().clone(),
            unknown.clone(),
            keys[1].key_id().clone(),
        ];
        assert_eq!(
            store.get_keys_by_id(&ids, true),
            Err(KmeError::KeyNotFound(vec![unknown]))
        );
        assert_eq!(store.size(), 2);
        assert_eq!(store.stats().consumed_keys, 0);
    }

    #[test]
    fn test_dec_path_collapses_duplicate_ids() {
        let (store, _sync) = store_with_mock(10);
        let keys = store.get_new_key(1, 256, false).unwrap();
        let id = keys[0].key_id().clone();

        let got = store.get_keys_by_id(&[id.clone(), id.clone()], true).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(store.stats().consumed_keys, 1);
    }

    #[test]
    fn test_remove_keys_is_idempotent_and_mirrors() {
        let (store, sync) = store_with_mock(10);
        let keys = store.get_new_key(2, 256, false).unwrap();
        let ids: Vec<KeyId> = keys.iter().map(|k| k.key_id().clone()).collect();

        assert_eq!(store.remove_keys(&sae("A"), &sae("B"), &ids), 2);
        // Second removal is a logged no-op locally
        assert_eq!(store.remove_keys(&sae("A"), &sae("B"), &ids), 0);
        assert_eq!(store.size(), 0);

        let removals = sync
            .calls()
            .into_iter()
            .filter(|c| matches!(c, SyncCall::RemoveKeys { .. }))
            .count();
        assert_eq!(removals, 2);
    }

    #[test]
    fn test_peer_keys_arrive_reserved() {
        let (generator, _) = store_with_mock(10);
        let (retriever, _) = store_with_mock(10);

        let keys = generator.get_new_key(2, 256, false).unwrap();
        let batch = KeyBatch {
            master_sae_id: sae("A"),
            slave_sae_id: sae("B"),
            sender_email: Some("alice@x".into()),
            receiver_email: Some("bob@x".into()),
            keys: keys.clone(),
        };
        assert_eq!(retriever.apply_peer_keys(&batch).unwrap(), 2);
        // Replaying the same batch adds nothing
        assert_eq!(retriever.apply_peer_keys(&batch).unwrap(), 0);

        // Mirrored keys are not handed out as fresh encryption keys
        let fresh = retriever.get_new_key(1, 256, false).unwrap();
        assert!(keys.iter().all(|k| k.key_id() != fresh[0].key_id()));
        assert_eq!(
            retriever.verify_receiver(keys[0].key_id(), Some("bob@x")),
            ReceiverCheck::Verified
        );
    }

    #[test]
    fn test_replayed_exchange_cannot_revive_consumed_key() {
        let (generator, _) = store_with_mock(10);
        let (retriever, _) = store_with_mock(10);

        let keys = generator.get_new_key(1, 256, false).unwrap();
        let id = keys[0].key_id().clone();
        let batch = KeyBatch {
            master_sae_id: sae("A"),
            slave_sae_id: sae("B"),
            sender_email: None,
            receiver_email: None,
            keys,
        };

        assert_eq!(retriever.apply_peer_keys(&batch).unwrap(), 1);
        assert_eq!(retriever.get_keys_by_id(&[id.clone()], true).unwrap().len(), 1);

        // A retried or replayed delivery of the same batch lands afterwards
        assert_eq!(retriever.apply_peer_keys(&batch).unwrap(), 0);
        assert!(!retriever.contains(&id));
        assert!(retriever.get_key_email_info(&id).is_none());
        assert_eq!(
            retriever.get_keys_by_id(&[id.clone()], true),
            Err(KmeError::KeyNotFound(vec![id]))
        );
        assert_eq!(retriever.stats().consumed_keys, 1);
    }

    #[test]
    fn test_removal_overtaking_delivery_wins() {
        let (generator, _) = store_with_mock(10);
        let (retriever, _) = store_with_mock(10);

        let keys = generator.get_new_key(2, 256, false).unwrap();
        let ids: Vec<KeyId> = keys.iter().map(|k| k.key_id().clone()).collect();

        // Removal arrives before the keys it names
        assert_eq!(retriever.apply_peer_removal(&ids[..1]), 0);
        let batch = KeyBatch {
            master_sae_id: sae("A"),
            slave_sae_id: sae("B"),
            sender_email: None,
            receiver_email: None,
            keys,
        };
        assert_eq!(retriever.apply_peer_keys(&batch).unwrap(), 1);
        assert!(!retriever.contains(&ids[0]));
        assert!(retriever.contains(&ids[1]));
    }

    #[test]
    fn test_retired_id_memory_is_bounded() {
        let mut retired = RetiredIds::new(2);
        let ids: Vec<KeyId> = (0..3).map(|_| KeyId::generate()).collect();
        for id in &ids {
            retired.insert(id);
        }
        retired.insert(&ids[2]);
        assert!(!retired.contains(&ids[0]));
        assert!(retired.contains(&ids[1]));
        assert!(retired.contains(&ids[2]));
        assert_eq!(retired.order.len(), 2);
    }

    #[test]
    fn test_mirror_removal_only_notifies_peers() {
        let (store, sync) = store_with_mock(10);
        let keys = store.get_new_key(1, 256, false).unwrap();
        let ids = vec![keys[0].key_id().clone()];

        store.get_keys_by_id(&ids, true).unwrap();
        store.mirror_removal(&sae("A"), &sae("B"), &ids);
        store.mirror_removal(&sae("A"), &sae("B"), &[]);

        let calls = sync.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], SyncCall::RemoveKeys { key_ids, .. } if *key_ids == ids));
        assert_eq!(store.stats().consumed_keys, 1);
    }

    #[test]
    fn test_apply_peer_removal_counts() {
        let (store, sync) = store_with_mock(10);
        let keys = store.get_new_key(2, 256, false).unwrap();
        let ids: Vec<KeyId> = keys.iter().map(|k| k.key_id().clone()).collect();

        assert_eq!(store.apply_peer_removal(&ids), 2);
        assert_eq!(store.apply_peer_removal(&ids), 0);
        assert_eq!(store.stats().mirrored_removals, 2);
        // Inbound removals are never re-broadcast
        assert!(sync.calls().is_empty());
    }

    #[test]
    fn test_refill_only_below_threshold() {
        let store = KeyStore::standalone(KeyPool::new(10, 4));
        assert_eq!(store.refill(256).unwrap(), 10);
        assert_eq!(store.refill(256).unwrap(), 0);

        store.get_new_key(7, 256, true).unwrap();
        assert_eq!(store.size(), 3);
        assert_eq!(store.refill(256).unwrap(), 7);
        assert_eq!(store.stats().generated_keys, 17);
    }

    #[test]
    fn test_invalid_requests() {
        let store = KeyStore::standalone(KeyPool::new(10, 4));
        assert!(matches!(store.get_new_key(0, 256, false), Err(KmeError::InvalidRequest(_))));
        assert_eq!(store.get_new_key(1, 7, false), Err(KmeError::InvalidKeySize(7)));
        assert!(matches!(store.get_keys_by_id(&[], true), Err(KmeError::InvalidRequest(_))));
    }
}
