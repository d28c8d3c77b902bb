use proptest::prelude::*;

use zstream_core::ChunkKey;
use zstream_runtime::{AccessHistory, PrefetchStrategy};

fn strategy() -> impl Strategy<Value = PrefetchStrategy> {
    prop_oneof![
        (1usize..8).prop_map(|lookahead| PrefetchStrategy::Sequential { lookahead }),
        (1usize..8, 1usize..4).prop_map(|(lookahead, min_stable_transitions)| {
            PrefetchStrategy::Pattern {
                lookahead,
                min_stable_transitions,
            }
        }),
    ]
}

proptest! {
    #[test]
    fn predictions_stay_in_bounds(
        s in strategy(),
        num_chunks in 1u64..200,
        trail in proptest::collection::vec(0u64..200, 0..8),
        observed in 0u64..200,
    ) {
        let observed = ChunkKey(observed % num_chunks);
        let history: AccessHistory = trail.into_iter().map(|k| ChunkKey(k % num_chunks)).collect();
        let predicted = s.predict(observed, &history, num_chunks);
        prop_assert!(predicted.len() <= s.lookahead());
        prop_assert!(predicted.iter().all(|k| k.0 < num_chunks));
        prop_assert!(!predicted.contains(&observed));
    }

    #[test]
    fn sequential_is_the_next_keys(start in 0u64..100, lookahead in 1usize..10, num_chunks in 1u64..120) {
        let s = PrefetchStrategy::Sequential { lookahead };
        let predicted = s.predict(ChunkKey(start), &AccessHistory::new(4), num_chunks);
        let expected: Vec<ChunkKey> = (start + 1..num_chunks)
            .take(lookahead)
            .map(ChunkKey)
            .collect();
        prop_assert_eq!(predicted, expected);
    }

    #[test]
    fn steady_stride_is_followed(start in 0u64..50, stride in 1u64..10, lookahead in 1usize..6) {
        let s = PrefetchStrategy::Pattern { lookahead, min_stable_transitions: 2 };
        let history: AccessHistory = [start, start + stride].into_iter().map(ChunkKey).collect();
        let observed = ChunkKey(start + 2 * stride);
        let predicted = s.predict(observed, &history, u64::MAX);
        let expected: Vec<ChunkKey> = (1..=lookahead as u64)
            .map(|i| ChunkKey(observed.0 + i * stride))
            .collect();
        prop_assert_eq!(predicted, expected);
    }
}
