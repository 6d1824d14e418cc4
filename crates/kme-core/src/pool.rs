//! Raw key-material container for one node
//!
//! [`KeyPool`] is a plain data structure: it takes `&mut self` for every
//! mutation and leaves locking to its owner ([`crate::KeyStore`]), so the
//! read-check-mutate sequences in the store run under a single guard.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::error::{KmeError, KmeResult};
use crate::identity::KeyId;
use crate::key::{Key, validate_size};

/// Default maximum number of keys held by a pool
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

/// Default size below which the pool asks for a refill
pub const DEFAULT_REFILL_THRESHOLD: usize = 250;

/// Ordered, capacity-bounded collection of keys keyed by ID
#[derive(Debug)]
pub struct KeyPool {
    /// Arena of keys by ID
    keys: HashMap<KeyId, Key>,
    /// Insertion order, oldest first
    order: VecDeque<KeyId>,
    /// Upper bound on `keys.len()`
    capacity: usize,
    /// Refill is due while the pool holds fewer keys than this
    refill_threshold: usize,
    /// Keys generated by this pool over its lifetime
    generated: u64,
}

impl Default for KeyPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_REFILL_THRESHOLD)
    }
}

impl KeyPool {
    /// Create an empty pool
    ///
    /// The refill threshold is clamped to the capacity.
    pub fn new(capacity: usize, refill_threshold: usize) -> Self {
        Self {
            keys: HashMap::with_capacity(capacity.min(4096)),
            order: VecDeque::new(),
            capacity,
            refill_threshold: refill_threshold.min(capacity),
            generated: 0,
        }
    }

    /// Generate `count` keys of `size_bits`, append them and return copies
    ///
    /// Fails without generating anything if the batch would exceed capacity.
    pub fn generate_batch(&mut self, count: usize, size_bits: usize) -> KmeResult<Vec<Key>> {
        validate_size(size_bits)?;
        if count > self.available() {
            return Err(KmeError::CapacityExceeded {
                current: self.keys.len(),
                requested: count,
                capacity: self.capacity,
            });
        }

        let mut batch = Vec::with_capacity(count);
        while batch.len() < count {
            let key = Key::generate(size_bits)?;
            if self.keys.contains_key(key.key_id()) {
                continue;
            }
            self.order.push_back(key.key_id().clone());
            self.keys.insert(key.key_id().clone(), key.clone());
            batch.push(key);
        }
        self.generated += count as u64;

        debug!(count, size_bits, pool_size = self.keys.len(), "Generated key batch");
        Ok(batch)
    }

    /// Insert keys generated elsewhere (peer mirror)
    ///
    /// Keys whose ID is already present are skipped. Returns how many keys
    /// were actually added.
    pub fn insert(&mut self, keys: Vec<Key>) -> KmeResult<usize> {
        let mut fresh: Vec<Key> = Vec::with_capacity(keys.len());
        for key in keys {
            if self.keys.contains_key(key.key_id())
                || fresh.iter().any(|k| k.key_id() == key.key_id())
            {
                trace!(key_id = %key.key_id(), "Skipping duplicate key");
                continue;
            }
            fresh.push(key);
        }

        if fresh.len() > self.available() {
            return Err(KmeError::CapacityExceeded {
                current: self.keys.len(),
                requested: fresh.len(),
                capacity: self.capacity,
            });
        }

        let added = fresh.len();
        for key in fresh {
            self.order.push_back(key.key_id().clone());
            self.keys.insert(key.key_id().clone(), key);
        }
        Ok(added)
    }

    /// Take locally generated keys, as many as still fit
    ///
    /// Surplus and duplicate keys are dropped. Counts toward
    /// [`generated_total`](Self::generated_total).
    pub fn absorb_generated(&mut self, keys: Vec<Key>) -> usize {
        let mut added = 0;
        for key in keys {
            if self.available() == 0 {
                break;
            }
            if self.keys.contains_key(key.key_id()) {
                continue;
            }
            self.order.push_back(key.key_id().clone());
            self.keys.insert(key.key_id().clone(), key);
            added += 1;
        }
        self.generated += added as u64;
        if added > 0 {
            debug!(added, pool_size = self.keys.len(), "Absorbed generated keys");
        }
        added
    }

    /// Fetch a key by ID
    ///
    /// With `remove = false` a copy is returned and the pool is untouched.
    /// With `remove = true` the key is taken out of the pool.
    pub fn get_key(&mut self, key_id: &KeyId, remove: bool) -> KmeResult<Key> {
        if !remove {
            return self
                .keys
                .get(key_id)
                .cloned()
                .ok_or_else(|| KmeError::KeyNotFound(vec![key_id.clone()]));
        }

        let key = self
            .keys
            .remove(key_id)
            .ok_or_else(|| KmeError::KeyNotFound(vec![key_id.clone()]))?;
        self.order.retain(|id| id != key_id);
        Ok(key)
    }

    /// Whether a key with this ID is present
    pub fn contains(&self, key_id: &KeyId) -> bool {
        self.keys.contains_key(key_id)
    }

    /// Iterate keys oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Key> + '_ {
        self.order.iter().filter_map(|id| self.keys.get(id))
    }

    /// Number of keys currently held
    pub fn size(&self) -> usize {
        self.keys.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// How many more keys fit before capacity is reached
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.keys.len())
    }

    /// Maximum number of keys
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refill threshold
    pub fn refill_threshold(&self) -> usize {
        self.refill_threshold
    }

    /// Whether the pool has dropped below its refill threshold
    pub fn needs_refill(&self) -> bool {
        self.keys.len() < self.refill_threshold
    }

    /// Keys generated over the pool's lifetime
    pub fn generated_total(&self) -> u64 {
        self.generated
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_generate_batch_appends() {
        let mut pool = KeyPool::new(10, 2);
        let batch = pool.generate_batch(4, 256).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.available(), 6);
        assert_eq!(pool.generated_total(), 4);
        for key in &batch {
            assert!(pool.contains(key.key_id()));
        }
    }

    #[test]
    fn test_generate_batch_respects_capacity() {
        let mut pool = KeyPool::new(3, 1);
        pool.generate_batch(2, 128).unwrap();

        let err = pool.generate_batch(2, 128).unwrap_err();
        assert_eq!(
            err,
            KmeError::CapacityExceeded {
                current: 2,
                requested: 2,
                capacity: 3
            }
        );
        // Nothing partially generated
        assert_eq!(pool.size(), 2);

        // Caller may ask for fewer
        pool.generate_batch(1, 128).unwrap();
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_generate_batch_rejects_bad_size() {
        let mut pool = KeyPool::new(3, 1);
        assert_eq!(pool.generate_batch(1, 100), Err(KmeError::InvalidKeySize(100)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_get_key_copy_does_not_mutate() {
        let mut pool = KeyPool::new(5, 1);
        let key = pool.generate_batch(1, 256).unwrap().remove(0);

        let copy = pool.get_key(key.key_id(), false).unwrap();
        assert_eq!(copy, key);
        assert_eq!(pool.size(), 1);

        let again = pool.get_key(key.key_id(), false).unwrap();
        assert_eq!(again, key);
    }

    #[test]
    fn test_get_key_remove_is_one_shot() {
        let mut pool = KeyPool::new(5, 1);
        let key = pool.generate_batch(1, 256).unwrap().remove(0);

        let taken = pool.get_key(key.key_id(), true).unwrap();
        assert_eq!(taken, key);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.iter().count(), 0);

        assert_eq!(
            pool.get_key(key.key_id(), true),
            Err(KmeError::KeyNotFound(vec![key.key_id().clone()]))
        );
    }

    #[test]
    fn test_insert_skips_duplicates() {
        let mut source = KeyPool::new(5, 1);
        let keys = source.generate_batch(3, 256).unwrap();

        let mut mirror = KeyPool::new(5, 1);
        assert_eq!(mirror.insert(keys.clone()).unwrap(), 3);
        assert_eq!(mirror.insert(keys).unwrap(), 0);
        assert_eq!(mirror.size(), 3);
        assert_eq!(mirror.generated_total(), 0);
    }

    #[test]
    fn test_insert_respects_capacity() {
        let mut source = KeyPool::new(5, 1);
        let keys = source.generate_batch(3, 256).unwrap();

        let mut mirror = KeyPool::new(2, 1);
        assert!(matches!(
            mirror.insert(keys),
            Err(KmeError::CapacityExceeded { requested: 3, .. })
        ));
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_absorb_generated_stops_at_capacity() {
        let mut pool = KeyPool::new(3, 3);
        pool.generate_batch(1, 256).unwrap();

        let fresh: Vec<Key> = (0..4).map(|_| Key::generate(256).unwrap()).collect();
        assert_eq!(pool.absorb_generated(fresh.clone()), 2);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.generated_total(), 3);
        assert!(pool.contains(fresh[0].key_id()));
        assert!(!pool.contains(fresh[3].key_id()));

        // Full pool takes nothing more
        assert_eq!(pool.absorb_generated(fresh), 0);
        assert_eq!(pool.generated_total(), 3);
    }

    #[test]
    fn test_iter_is_oldest_first() {
        let mut pool = KeyPool::new(10, 1);
        let first = pool.generate_batch(2, 64).unwrap();
        let second = pool.generate_batch(2, 64).unwrap();

        let ids: Vec<_> = pool.iter().map(|k| k.key_id().clone()).collect();
        let expected: Vec<_> = first
            .iter()
            .chain(second.iter())
            .map(|k| k.key_id().clone())
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_refill_threshold() {
        let mut pool = KeyPool::new(4, 10);
        // Clamped to capacity
        assert_eq!(pool.refill_threshold(), 4);
        assert!(pool.needs_refill());
        pool.generate_batch(4, 64).unwrap();
        assert!(!pool.needs_refill());
    }

    #[test]
    fn test_ids_unique_across_batches() {
        let mut pool = KeyPool::new(500, 1);
        let mut seen = HashSet::new();
        for _ in 0..5 {
            for key in pool.generate_batch(100, 64).unwrap() {
                assert!(seen.insert(key.key_id().clone()));
            }
        }
        assert_eq!(seen.len(), 500);
    }
}
