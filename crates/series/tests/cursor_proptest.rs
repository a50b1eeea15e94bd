//! Property-based tests for chain ordering and cursor movement.
//!
//! Chains are driven with random mutation sequences and compared against a
//! `BTreeMap` model of the series.

use alopex_series::{BlockChain, ChainConfig, Lookup};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Append(i64),
    Insert(i64),
    Remove(i64),
    RemoveFirst,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1i64..50).prop_map(Op::Append),
        3 => (0i64..1_000).prop_map(Op::Insert),
        2 => (0i64..1_000).prop_map(Op::Remove),
        1 => Just(Op::RemoveFirst),
    ]
}

/// Builds a chain by applying `ops`, mirroring every change in a model.
fn build(capacity: usize, ops: &[Op]) -> (Arc<BlockChain<i64, f64>>, BTreeMap<i64, f64>) {
    let chain = BlockChain::new(ChainConfig::default().with_block_capacity(capacity));
    let mut model = BTreeMap::new();
    for op in ops {
        match *op {
            Op::Append(delta) => {
                let key = model.keys().next_back().map_or(0, |last| last + delta);
                chain.append(key, key as f64).unwrap();
                model.insert(key, key as f64);
            }
            Op::Insert(key) => {
                let inserted = chain.insert(key, -(key as f64)).is_ok();
                assert_eq!(inserted, !model.contains_key(&key));
                model.entry(key).or_insert(-(key as f64));
            }
            Op::Remove(key) => {
                let removed = chain.remove(key).unwrap();
                assert_eq!(removed, model.remove(&key).is_some());
            }
            Op::RemoveFirst => {
                let first = model.keys().next().copied();
                let evicted = chain.remove_first().unwrap().map(|(k, _)| k);
                assert_eq!(evicted, first);
                if let Some(first) = first {
                    model.remove(&first);
                }
            }
        }
    }
    (Arc::new(chain), model)
}

/// Mostly short strides, with magnitudes up to the `i64` limits mixed in.
fn stride_strategy() -> impl Strategy<Value = i64> {
    prop_oneof![
        6 => -150i64..150,
        2 => any::<i64>(),
        1 => prop::sample::select(vec![i64::MIN, i64::MIN + 1, i64::MAX, i64::MAX - 1]),
    ]
}

fn series_strategy() -> impl Strategy<Value = (usize, Vec<Op>)> {
    (1usize..8, prop::collection::vec(op_strategy(), 1..120))
}

proptest! {
    /// Adjacent blocks never overlap and rows inside a block are sorted.
    #[test]
    fn test_chain_ordering_proptest((capacity, ops) in series_strategy()) {
        let (chain, model) = build(capacity, &ops);

        let blocks = chain.blocks();
        for pair in blocks.windows(2) {
            if let (Some(left), Some(right)) = (pair[0].last_key(), pair[1].first_key()) {
                prop_assert!(left < right);
            }
        }

        let mut cursor = chain.cursor();
        let mut rows = Vec::new();
        while cursor.move_next().unwrap() {
            rows.push(cursor.current());
        }
        let expected: Vec<(i64, f64)> = model.into_iter().collect();
        prop_assert_eq!(rows, expected);
        prop_assert_eq!(chain.len(), blocks.iter().map(|b| b.row_count()).sum::<usize>());
    }

    /// Exact moves land on row `i + n` or stay put; partial moves clamp.
    #[test]
    fn test_move_by_proptest(
        (capacity, ops) in series_strategy(),
        start in 0usize..200,
        stride in stride_strategy(),
        allow_partial in any::<bool>(),
    ) {
        let (chain, model) = build(capacity, &ops);
        let keys: Vec<i64> = model.keys().copied().collect();
        prop_assume!(!keys.is_empty());
        let start = start % keys.len();

        let mut cursor = chain.cursor();
        prop_assert!(cursor.move_at(keys[start], Lookup::Eq).unwrap());

        let moved = cursor.move_by(stride, allow_partial).unwrap();
        let target = start as i128 + stride as i128;
        let last = keys.len() as i128 - 1;

        if (0..=last).contains(&target) {
            prop_assert_eq!(moved, stride);
            prop_assert_eq!(cursor.current_key(), keys[target as usize]);
        } else if allow_partial {
            let clamped = target.clamp(0, last);
            prop_assert_eq!(moved as i128, clamped - start as i128);
            prop_assert_eq!(cursor.current_key(), keys[clamped as usize]);
        } else {
            prop_assert_eq!(moved, 0);
            prop_assert_eq!(cursor.current_key(), keys[start]);
        }
    }

    /// Every stored key can be found again with an exact seek.
    #[test]
    fn test_seek_round_trip_proptest((capacity, ops) in series_strategy()) {
        let (chain, model) = build(capacity, &ops);
        let mut cursor = chain.cursor();
        for (&key, &value) in &model {
            prop_assert!(cursor.move_at(key, Lookup::Eq).unwrap());
            prop_assert_eq!(cursor.current(), (key, value));
        }
        if let Some((&first, _)) = model.iter().next() {
            prop_assert!(!cursor.move_at(first, Lookup::Lt).unwrap());
            prop_assert_eq!(cursor.current_key(), *model.keys().next_back().unwrap());
        }
    }
}
