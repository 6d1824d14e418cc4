//! Stress tests for kme-core
//!
//! These tests verify the key store under concurrent access: one-time-use
//! retirement, reservation on the encryption path, and in-process
//! replication between a generator and a retriever.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use kme_core::{KeyId, KeyPool, KeyStore, KmeError, MockSync, SaeId};

fn sae(s: &str) -> SaeId {
    SaeId::new(s).unwrap()
}

/// Generator and retriever stores wired through mock replication
fn linked_pair(capacity: usize) -> (Arc<KeyStore>, Arc<KeyStore>, Arc<MockSync>, Arc<MockSync>) {
    let to_retriever = Arc::new(MockSync::new());
    let to_generator = Arc::new(MockSync::new());
    let generator = Arc::new(KeyStore::new(
        KeyPool::new(capacity, capacity / 4),
        to_retriever.clone(),
    ));
    let retriever = Arc::new(KeyStore::new(KeyPool::new(capacity, 0), to_generator.clone()));
    to_retriever.link(&retriever);
    to_generator.link(&generator);
    (generator, retriever, to_retriever, to_generator)
}

// ============================================================================
// One-Time Use
// ============================================================================

/// Many threads racing to consume the same key
///
/// Exactly one destructive read may succeed; every other caller must see
/// `KeyNotFound`.
#[test]
fn test_concurrent_dec_single_winner() {
    let store = Arc::new(KeyStore::standalone(KeyPool::new(10, 0)));
    let key = store.get_new_key(1, 256, false).unwrap().remove(0);
    let id = key.key_id().clone();

    let threads = 32;
    let barrier = Arc::new(Barrier::new(threads));
    let winners = Arc::new(AtomicUsize::new(0));
    let losers = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = store.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            let losers = losers.clone();
            let id = id.clone();
            thread::spawn(move || {
                barrier.wait();
                match store.get_keys_by_id(&[id.clone()], true) {
                    Ok(keys) => {
                        assert_eq!(keys[0].key_id(), &id);
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(KmeError::KeyNotFound(missing)) => {
                        assert_eq!(missing, vec![id]);
                        losers.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(losers.load(Ordering::SeqCst), threads - 1);
    assert_eq!(store.stats().consumed_keys, 1);
}

/// Concurrent encryption requests never share a key
#[test]
fn test_concurrent_enc_unique_keys() {
    let store = Arc::new(KeyStore::standalone(KeyPool::new(4_000, 1_000)));
    store.refill(256).unwrap();

    let threads = 16;
    let per_thread = 50;
    let barrier = Arc::new(Barrier::new(threads));

    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut ids = Vec::new();
                for _ in 0..per_thread {
                    let keys = store.get_new_key(2, 256, false).unwrap();
                    ids.extend(keys.iter().map(|k| k.key_id().clone()));
                }
                ids
            })
        })
        .collect();

    let mut seen: HashSet<KeyId> = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "key issued twice");
        }
    }
    println!(
        "Issued {} keys across {} threads in {:?}",
        seen.len(),
        threads,
        start.elapsed()
    );

    assert_eq!(seen.len(), threads * per_thread * 2);
    assert_eq!(store.stats().reserved_keys, seen.len());
}

/// Parallel consumers each draining a disjoint slice of keys
#[test]
fn test_concurrent_dec_disjoint_batches() {
    let store = Arc::new(KeyStore::standalone(KeyPool::new(1_000, 0)));
    let keys = store.get_new_key(800, 128, false).unwrap();
    let ids: Vec<KeyId> = keys.iter().map(|k| k.key_id().clone()).collect();

    thread::scope(|scope| {
        for chunk in ids.chunks(100) {
            let store = &store;
            scope.spawn(move || {
                for pair in chunk.chunks(2) {
                    store.get_keys_by_id(pair, true).unwrap();
                }
            });
        }
    });

    assert_eq!(store.size(), 0);
    assert_eq!(store.stats().consumed_keys, 800);
}

// ============================================================================
// Replication
// ============================================================================

/// Full lifecycle across a generator and a retriever
#[test]
fn test_replicated_lifecycle() {
    let (generator, retriever, _to_retriever, _to_generator) = linked_pair(100);

    let keys = generator.get_new_key(3, 256, false).unwrap();
    generator
        .append_keys(
            &sae("A"),
            &sae("B"),
            keys.clone(),
            Some("alice@x".into()),
            Some("bob@x".into()),
            true,
        )
        .unwrap();

    // Retriever mirrors the keys and their association
    for key in &keys {
        assert!(retriever.contains(key.key_id()));
        let info = retriever.get_key_email_info(key.key_id()).unwrap();
        assert_eq!(info.sender_email.as_deref(), Some("alice@x"));
    }

    // Retriever consumes and mirrors the removal back
    let ids: Vec<KeyId> = keys.iter().map(|k| k.key_id().clone()).collect();
    let got = retriever.get_keys_by_id(&ids, true).unwrap();
    assert_eq!(got, keys);
    retriever.mirror_removal(&sae("A"), &sae("B"), &ids);

    for id in &ids {
        assert!(!generator.contains(id));
        assert!(!retriever.contains(id));
    }
    assert_eq!(generator.stats().mirrored_removals, 3);
    assert_eq!(retriever.stats().consumed_keys, 3);
}

/// Keys are missing on the retriever until replication catches up
#[test]
fn test_eventual_consistency_window() {
    let (generator, retriever, to_retriever, _to_generator) = linked_pair(100);
    to_retriever.set_partitioned(true);

    let keys = generator.get_new_key(1, 256, false).unwrap();
    let id = keys[0].key_id().clone();
    generator
        .append_keys(&sae("A"), &sae("B"), keys, None, None, true)
        .unwrap();

    assert_eq!(
        retriever.get_keys_by_id(&[id.clone()], true),
        Err(KmeError::KeyNotFound(vec![id.clone()]))
    );
    assert!(KmeError::KeyNotFound(vec![id.clone()]).is_retryable());

    to_retriever.set_partitioned(false);
    to_retriever.deliver_pending();
    assert!(retriever.get_keys_by_id(&[id], true).is_ok());
}

/// A removal lost to a partition leaves the generator holding the key
///
/// The key stays reserved there, so it is never re-issued for encryption.
#[test]
fn test_lost_removal_keeps_key_reserved() {
    let (generator, retriever, _to_retriever, to_generator) = linked_pair(10);

    let keys = generator.get_new_key(1, 256, false).unwrap();
    let id = keys[0].key_id().clone();
    generator
        .append_keys(&sae("A"), &sae("B"), keys, None, None, true)
        .unwrap();

    to_generator.set_partitioned(true);
    retriever.get_keys_by_id(&[id.clone()], true).unwrap();
    retriever.mirror_removal(&sae("A"), &sae("B"), &[id.clone()]);

    assert!(generator.contains(&id));
    assert!(generator.is_reserved(&id));
    for key in generator.get_new_key(5, 256, false).unwrap() {
        assert_ne!(key.key_id(), &id);
    }

    to_generator.set_partitioned(false);
    assert_eq!(to_generator.deliver_pending(), 1);
    assert!(!generator.contains(&id));
}
