//! Assigning keys to the worker partitions of a stage.
use std::hash::{Hash, Hasher};

use seahash::SeaHasher;

/// Select one of `partitions` partitions for a value by applying
/// [rendezvous hashing](https://en.wikipedia.org/wiki/Rendezvous_hashing).
///
/// The hash is stable across processes and runs, so a key always lands on the same
/// partition for a given partition count, and changing the count moves as few keys as
/// possible.
///
/// **PANIC:** if `partitions` is zero
pub fn rendezvous_select<V: Hash + ?Sized>(value: &V, partitions: usize) -> usize {
    assert!(partitions > 0, "Need at least one partition");
    let mut hasher = SeaHasher::new();
    value.hash(&mut hasher);

    (0..partitions)
        .max_by_key(|idx| {
            let mut h = hasher.clone();
            idx.hash(&mut h);
            h.finish()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_partition() {
        assert_eq!(rendezvous_select("anything", 1), 0);
    }

    proptest! {
    #[test]
    fn stays_in_range(key in ".*", n in 1usize..16) {
        prop_assert!(rendezvous_select(&key, n) < n);
    }

    #[test]
    fn is_deterministic(key in ".*", n in 1usize..16) {
        prop_assert_eq!(rendezvous_select(&key, n), rendezvous_select(&key, n));
    }

    /// adding a partition only ever moves keys onto the new partition
    #[test]
    fn minimal_movement(key in ".*", n in 1usize..16) {
        let before = rendezvous_select(&key, n);
        let after = rendezvous_select(&key, n + 1);
        prop_assert!(after == before || after == n);
    }
    }
}
