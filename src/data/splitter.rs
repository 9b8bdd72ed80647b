// ============================================================
// Layer 4 - Train/Test Splitter
// ============================================================
// Shuffles records with a SEEDED generator and splits them into:
//   - Training set: used to update the adapter weights
//   - Test set:     used to measure loss on unseen examples
//                   and to pick the inference example
//
// Split sizes:
//   n_test  = ceil(test_fraction * n)   (clamped to n)
//   n_train = n - n_test
//
// Determinism:
//   The same seed and the same input order always produce the
//   same partition, so a run can be reproduced exactly.
//   StdRng::seed_from_u64 is used instead of thread_rng().
//
// Uses Fisher-Yates shuffle via rand::seq::SliceRandom.
//
// Reference: Rust Book §8 (Vectors)
//            rand crate documentation

use anyhow::{bail, Result};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Number of test items for `total` items.
/// The small epsilon keeps 0.2 * 100 from rounding up to 21.
pub fn test_count(total: usize, test_fraction: f64) -> usize {
    let raw = (test_fraction * total as f64 - 1e-9).ceil().max(0.0) as usize;
    raw.min(total)
}

/// Shuffle `items` with `seed` and split into (train, test).
///
/// # Arguments
/// * `items`         - All available items (consumed by this function)
/// * `test_fraction` - Proportion held out, e.g. 0.2 = 20%
/// * `seed`          - Shuffle seed
pub fn split_train_test<T>(
    mut items:     Vec<T>,
    test_fraction: f64,
    seed:          u64,
) -> Result<(Vec<T>, Vec<T>)> {
    if !(0.0..1.0).contains(&test_fraction) {
        bail!("test_fraction must be in [0, 1), got {test_fraction}");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);

    let total    = items.len();
    let n_test   = test_count(total, test_fraction);
    let split_at = total - n_test;

    // split_off(n) removes elements [n..] and returns them
    let test = items.split_off(split_at);

    tracing::debug!(
        "Dataset split (seed {}): {} train, {} test",
        seed,
        items.len(),
        test.len(),
    );

    Ok((items, test))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_correct_split_sizes() {
        let items: Vec<usize> = (0..100).collect();
        let (train, test)     = split_train_test(items, 0.2, 42).unwrap();
        assert_eq!(train.len(), 80);
        assert_eq!(test.len(),  20);
    }

    #[test]
    fn test_sizes_round_test_up() {
        assert_eq!(test_count(7, 0.2), 2);   // 1.4 → 2
        assert_eq!(test_count(10, 0.2), 2);
        assert_eq!(test_count(35, 0.2), 7);
        assert_eq!(test_count(1, 0.2), 1);
        assert_eq!(test_count(0, 0.2), 0);
        assert_eq!(test_count(10, 0.0), 0);
    }

    #[test]
    fn test_same_seed_same_partition() {
        let a = split_train_test((0..50).collect::<Vec<_>>(), 0.2, 7).unwrap();
        let b = split_train_test((0..50).collect::<Vec<_>>(), 0.2, 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seed_changes_order() {
        let a = split_train_test((0..50).collect::<Vec<_>>(), 0.2, 1).unwrap();
        let b = split_train_test((0..50).collect::<Vec<_>>(), 0.2, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_disjoint_and_union_is_input() {
        let items: Vec<usize> = (0..73).collect();
        let (train, test)     = split_train_test(items, 0.2, 1234).unwrap();

        let train_set: HashSet<_> = train.iter().copied().collect();
        let test_set:  HashSet<_> = test.iter().copied().collect();
        assert!(train_set.is_disjoint(&test_set));

        let union: HashSet<_> = train_set.union(&test_set).copied().collect();
        assert_eq!(union, (0..73).collect::<HashSet<_>>());
        assert_eq!(train.len() + test.len(), 73);
    }

    #[test]
    fn test_empty_dataset() {
        let (train, test) = split_train_test(Vec::<usize>::new(), 0.2, 0).unwrap();
        assert!(train.is_empty());
        assert!(test.is_empty());
    }

    #[test]
    fn test_rejects_bad_fraction() {
        assert!(split_train_test(vec![1, 2, 3], 1.0, 0).is_err());
        assert!(split_train_test(vec![1, 2, 3], -0.1, 0).is_err());
    }
}
