//! End-to-end B-tree scenarios: ordering under churn, bound queries and
//! operation under severe cache pressure.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use extmem::btree::{BTree, BTreeConfig};
use extmem::common::DefaultOrder;
use extmem::{Config, Runtime};

fn runtime() -> (tempfile::TempDir, Arc<Runtime>) {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::new(Config::with_devices(dir.path(), 1, 1 << 28)).unwrap();
    (dir, rt)
}

fn cfg() -> BTreeConfig {
    BTreeConfig {
        leaf_block_size: 4096,
        node_block_size: 4096,
        leaf_cache_bytes: 64 * 4096,
        node_cache_bytes: 64 * 4096,
        prefetching: true,
    }
}

#[test]
fn s5_ordering_persists_under_churn() {
    let (_dir, rt) = runtime();
    let tree = BTree::new(rt, DefaultOrder::<u64>::new(), cfg()).unwrap();

    let mut keys: Vec<u64> = (1..=100_000).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(6789));
    for &k in &keys {
        assert!(tree.insert(k, k * 2).unwrap());
    }
    for k in (1..=100_000u64).filter(|k| k % 2 == 1) {
        assert!(tree.erase(&k).unwrap(), "key {k}");
    }
    for k in 100_001..=150_000u64 {
        assert!(tree.insert(k, k * 2).unwrap());
    }

    let expected: Vec<u64> = (1..=100_000u64)
        .filter(|k| k % 2 == 0)
        .chain(100_001..=150_000)
        .collect();
    assert_eq!(tree.len(), expected.len());

    let mut cursor = tree.begin().unwrap();
    let mut seen = Vec::with_capacity(expected.len());
    while let Some((k, d)) = cursor.next().unwrap() {
        assert_eq!(d, k * 2, "data of key {k}");
        seen.push(k);
    }
    assert_eq!(seen, expected);
}

#[test]
fn lower_bound_contract() {
    let (_dir, rt) = runtime();
    let tree = BTree::new(rt, DefaultOrder::<u64>::new(), cfg()).unwrap();
    for k in (0..20_000u64).map(|i| i * 5) {
        tree.insert(k, 0).unwrap();
    }
    for probe in [0u64, 1, 4, 5, 4999, 50_001, 99_994, 99_995] {
        let cursor = tree.lower_bound(&probe).unwrap();
        let got = cursor.entry().unwrap().map(|e| e.0);
        let expect = (0..20_000u64).map(|i| i * 5).find(|k| *k >= probe);
        assert_eq!(got, expect, "lower_bound({probe})");
    }
    assert!(tree.lower_bound(&99_996).unwrap().is_end());
}

#[test]
fn s6_tiny_cache_under_pressure_still_serves() {
    let (_dir, rt) = runtime();
    // Eight leaf slots and eight node slots only; every operation churns
    // the caches.
    let tree = BTree::new(
        rt,
        DefaultOrder::<u64>::new(),
        BTreeConfig {
            leaf_block_size: 512,
            node_block_size: 512,
            leaf_cache_bytes: 8 * 512,
            node_cache_bytes: 8 * 512,
            prefetching: false,
        },
    )
    .unwrap();
    let mut keys: Vec<u64> = (0..20_000).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(55));
    for &k in &keys {
        tree.insert(k, !k).unwrap();
    }
    for &k in keys.iter().take(1000) {
        assert_eq!(tree.find(&k).unwrap(), Some(!k));
    }
    let mut cursor = tree.begin().unwrap();
    let mut count = 0u64;
    while let Some((k, _)) = cursor.next().unwrap() {
        assert_eq!(k, count);
        count += 1;
    }
    assert_eq!(count, 20_000);
}

#[test]
fn cursors_stay_valid_across_heavy_churn() {
    let (_dir, rt) = runtime();
    let tree = BTree::new(rt, DefaultOrder::<u64>::new(), cfg()).unwrap();
    for k in 0..10_000u64 {
        tree.insert(k * 10, k).unwrap();
    }
    // Pin cursors across the key space, then churn heavily around them.
    let anchors: Vec<u64> = (0..10).map(|i| i * 10_000).collect();
    let cursors: Vec<_> = anchors
        .iter()
        .map(|k| tree.lower_bound(k).unwrap())
        .collect();
    for k in 0..10_000u64 {
        tree.insert(k * 10 + 5, 0).unwrap();
    }
    for k in (0..10_000u64).step_by(2) {
        tree.erase(&(k * 10)).unwrap();
    }
    for (anchor, cursor) in anchors.iter().zip(&cursors) {
        let (k, _) = cursor.entry().unwrap().expect("cursor not at end");
        // Anchored entries with even base keys were erased; the cursor
        // slid to a successor, never backwards.
        assert!(k >= *anchor, "cursor at {k} drifted before {anchor}");
    }
}
