//! Model-based property tests
//!
//! Runs random operation sequences against the trie and a `BTreeMap`
//! reference, checking delete outcomes, canonical shape, insertion-order
//! independence of the root digest, and reopen-from-committed-root.

use proptest::prelude::*;
use std::collections::BTreeMap;

use crate::store::{MemoryStore, NullStore};
use crate::{Digest, Trie};

#[derive(Clone, Debug)]
enum Op {
    Add(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    Commit,
}

/// Keys drawn from a small alphabet so shared prefixes, branch splits, and
/// collapses happen often
fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        prop_oneof![
            Just(0x11u8),
            Just(0x12u8),
            Just(0x21u8),
            Just(0xabu8),
            any::<u8>(),
        ],
        1..4,
    )
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (key_strategy(), prop::collection::vec(any::<u8>(), 0..8))
            .prop_map(|(key, value)| Op::Add(key, value)),
        2 => key_strategy().prop_map(Op::Delete),
        1 => Just(Op::Commit),
    ]
}

proptest! {
    #[test]
    fn trie_matches_btreemap_model(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let store = MemoryStore::new();
        let mut trie = Trie::new(store.clone());
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Add(key, value) => {
                    trie.add(key, value).unwrap();
                    model.insert(key.clone(), value.clone());
                }
                Op::Delete(key) => {
                    let found = trie.delete(key).unwrap();
                    prop_assert_eq!(found, model.remove(key).is_some());
                }
                Op::Commit => {
                    trie.commit().unwrap();
                    trie.verify_canonical_shape();
                }
            }
        }
        trie.verify_canonical_shape();

        // same key/value set, different insertion order, different store:
        // same root digest
        let mut reference = Trie::new(NullStore::new());
        for (key, value) in &model {
            reference.add(key, value).unwrap();
        }
        prop_assert_eq!(trie.root_hash().unwrap(), reference.root_hash().unwrap());

        // reopen from the committed root and drain every key
        trie.commit().unwrap();
        let root = trie.root_hash().unwrap();
        let mut reopened = Trie::new(store);
        reopened.set_root(root);
        for key in model.keys() {
            prop_assert!(reopened.delete(key).unwrap());
        }
        prop_assert_eq!(reopened.root_hash().unwrap(), Digest::ZERO);
    }
}
