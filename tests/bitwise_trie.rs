//! Integration tests for the bitwise trie against an ordered-map model

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use slabcore::prelude::*;

fn node_slab() -> Arc<SizedSlab> {
    let configs = [
        BlockConfig::new(BitwiseTrie::<u64, u64>::leaf_size(), 128),
        BlockConfig::new(BitwiseTrie::<u64, u64>::branch_size(), 1024),
    ];
    Arc::new(SizedSlab::new(32, &configs).expect("node slab"))
}

#[test]
fn sorted_iteration_matches_insertion_set() {
    let trie: BitwiseTrie<u64, u64> = BitwiseTrie::new(node_slab());
    let keys = [
        0u64,
        1,
        42,
        0x8000_0000_0000_0000,
        u64::MAX,
        u64::MAX - 1,
        1 << 20,
    ];
    for &key in &keys {
        let (_, inserted) = trie.emplace(key, !key).expect("emplace");
        assert!(inserted);
    }
    let mut expected = keys.to_vec();
    expected.sort_unstable();
    let walked: Vec<u64> = trie.iter().map(|(key, _)| key).collect();
    assert_eq!(walked, expected);
    for (key, value) in trie.iter() {
        assert_eq!(*value, !key);
    }
}

#[test]
fn size_counts_leaves_not_branches() {
    let trie: BitwiseTrie<u64, u64> = BitwiseTrie::new(node_slab());
    // densely shared prefixes: all keys differ only in the low byte
    for low in 0..64u64 {
        trie.emplace(0xAB00 | low, low).expect("emplace");
    }
    assert_eq!(trie.len(), 64);
    trie.emplace(0xAB00, 999).expect("duplicate");
    assert_eq!(trie.len(), 64, "duplicates do not grow the trie");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// `find_less_equal` agrees with a BTreeMap predecessor query for
    /// arbitrary key sets and probes.
    #[test]
    fn predecessor_matches_btreemap_model(
        keys in proptest::collection::btree_set(any::<u64>(), 1..64),
        probes in proptest::collection::vec(any::<u64>(), 16),
    ) {
        let trie: BitwiseTrie<u64, u64> = BitwiseTrie::new(node_slab());
        let mut model = BTreeMap::new();
        for &key in &keys {
            trie.emplace(key, key.rotate_left(7)).expect("emplace");
            model.insert(key, key.rotate_left(7));
        }
        prop_assert_eq!(trie.len(), model.len());
        // probe at random points, at every key, and around every key
        for probe in probes
            .iter()
            .copied()
            .chain(keys.iter().copied())
            .chain(keys.iter().map(|k| k.wrapping_sub(1)))
            .chain(keys.iter().map(|k| k.wrapping_add(1)))
        {
            let expected = model.range(..=probe).next_back().map(|(k, v)| (*k, *v));
            let found = trie.find_less_equal(probe).map(|(k, v)| (k, *v));
            prop_assert_eq!(found, expected, "probe {}", probe);
        }
    }

    /// `find`, `min`, `max`, and iteration agree with the model.
    #[test]
    fn point_queries_match_btreemap_model(
        keys in proptest::collection::btree_set(any::<u64>(), 1..64),
        misses in proptest::collection::vec(any::<u64>(), 16),
    ) {
        let trie: BitwiseTrie<u64, u64> = BitwiseTrie::new(node_slab());
        let mut model = BTreeMap::new();
        for &key in &keys {
            trie.emplace(key, !key).expect("emplace");
            model.insert(key, !key);
        }
        for &key in &keys {
            prop_assert_eq!(trie.find(key), Some(&!key));
        }
        for miss in misses {
            prop_assert_eq!(trie.find(miss).copied(), model.get(&miss).copied());
        }
        prop_assert_eq!(trie.min().map(|(k, _)| k), model.keys().next().copied());
        prop_assert_eq!(trie.max().map(|(k, _)| k), model.keys().next_back().copied());
        let walked: Vec<u64> = trie.iter().map(|(key, _)| key).collect();
        let expected: Vec<u64> = model.keys().copied().collect();
        prop_assert_eq!(walked, expected);
    }
}
