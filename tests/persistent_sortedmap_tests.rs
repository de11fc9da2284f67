//! Unit tests for `PersistentSortedMap`.

use persimm::persistent::PersistentSortedMap;
use rstest::rstest;

// =============================================================================
// Basic Construction Tests
// =============================================================================

#[rstest]
fn test_new_creates_empty_map() {
    let map: PersistentSortedMap<i32, String> = PersistentSortedMap::new();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
}

#[rstest]
fn test_empty_map_iteration_is_done_immediately() {
    let map: PersistentSortedMap<i32, String> = PersistentSortedMap::new();
    let mut iterator = map.iter();
    assert_eq!(iterator.len(), 0);
    assert_eq!(iterator.next(), None);
    assert_eq!(iterator.next_back(), None);
}

#[rstest]
fn test_independent_empties_are_equal_by_value() {
    let first: PersistentSortedMap<i32, i32> = PersistentSortedMap::new();
    let second: PersistentSortedMap<i32, i32> = PersistentSortedMap::new();
    assert_eq!(first, second);
}

// =============================================================================
// Ordered Iteration Tests
// =============================================================================

#[rstest]
fn test_ordered_iteration_scenario() {
    // Insert keys "c", "a", "b" in that order; iteration yields a, b, c.
    let map = PersistentSortedMap::new()
        .insert("c".to_string(), 3)
        .insert("a".to_string(), 1)
        .insert("b".to_string(), 2);

    let entries: Vec<(String, i32)> = map
        .iter()
        .map(|(key, value)| (key.clone(), *value))
        .collect();
    assert_eq!(
        entries,
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3)
        ]
    );
}

#[rstest]
fn test_iteration_keys_strictly_increase() {
    let mut map = PersistentSortedMap::new();
    for key in [5_i64, 3, 9, 1, 7, 2, 8, 4, 6, 0] {
        map = map.insert(key, ());
    }

    let keys: Vec<i64> = map.keys().copied().collect();
    assert_eq!(keys, (0..10).collect::<Vec<i64>>());
    assert!(keys.windows(2).all(|window| window[0] < window[1]));
}

#[rstest]
fn test_reverse_iteration() {
    let map: PersistentSortedMap<i64, i64> = (0..1000).map(|key| (key, key)).collect();
    let keys: Vec<i64> = map.iter().rev().map(|(key, _)| *key).collect();
    let expected: Vec<i64> = (0..1000).rev().collect();
    assert_eq!(keys, expected);
}

// =============================================================================
// Deletion / Rebalance Tests
// =============================================================================

#[rstest]
fn test_delete_every_even_key_scenario() {
    // Build 10,000 sequential keys, delete every even key.
    let mut map = PersistentSortedMap::new();
    for key in 0..10_000_i64 {
        map = map.insert(key, key);
    }

    for key in (0..10_000_i64).filter(|key| key % 2 == 0) {
        map = map.remove(&key);
    }

    assert_eq!(map.len(), 5_000);

    let keys: Vec<i64> = map.keys().copied().collect();
    let expected: Vec<i64> = (0..10_000).filter(|key| key % 2 == 1).collect();
    assert_eq!(keys, expected);

    // Reinserting a deleted key restores presence without violating order.
    let restored = map.insert(4_000, 4_000);
    assert_eq!(restored.len(), 5_001);
    assert_eq!(restored.get(&4_000), Some(&4_000));
    let restored_keys: Vec<i64> = restored.keys().copied().collect();
    assert!(restored_keys.windows(2).all(|window| window[0] < window[1]));
}

#[rstest]
fn test_height_shrinks_back_down() {
    let mut map = PersistentSortedMap::new();
    for key in 0..2_000_i64 {
        map = map.insert(key, key);
    }
    for key in 100..2_000_i64 {
        map = map.remove(&key);
    }

    assert_eq!(map.len(), 100);
    for key in 0..100_i64 {
        assert_eq!(map.get(&key), Some(&key));
    }
}

#[rstest]
fn test_remove_missing_key_is_identity() {
    let map: PersistentSortedMap<i64, i64> = (0..100).map(|key| (key, key)).collect();
    let removed = map.remove(&1_000);

    assert_eq!(map, removed);
}

// =============================================================================
// Range / Seek Tests
// =============================================================================

#[rstest]
fn test_range_window() {
    let map: PersistentSortedMap<i64, i64> = (0..1000).map(|key| (key, key * 2)).collect();
    let window: Vec<(i64, i64)> = map.range(100..110).map(|(key, value)| (*key, *value)).collect();
    let expected: Vec<(i64, i64)> = (100..110).map(|key| (key, key * 2)).collect();
    assert_eq!(window, expected);
}

#[rstest]
fn test_seek_to_least_key_at_least() {
    let sparse: PersistentSortedMap<i64, ()> =
        [10_i64, 20, 30, 40].into_iter().map(|key| (key, ())).collect();

    assert_eq!(sparse.range(20..).next().map(|(key, _)| *key), Some(20));
    assert_eq!(sparse.range(21..).next().map(|(key, _)| *key), Some(30));
    assert_eq!(sparse.range(41..).next(), None);
}

#[rstest]
fn test_reverse_seek_to_greatest_key_at_most() {
    let sparse: PersistentSortedMap<i64, ()> =
        [10_i64, 20, 30, 40].into_iter().map(|key| (key, ())).collect();

    assert_eq!(sparse.range(..=30).next_back().map(|(key, _)| *key), Some(30));
    assert_eq!(sparse.range(..=29).next_back().map(|(key, _)| *key), Some(20));
    assert_eq!(sparse.range(..=9).next_back(), None);
}

#[rstest]
fn test_range_double_ended() {
    let map: PersistentSortedMap<i64, i64> = (0..100).map(|key| (key, key)).collect();
    let mut range = map.range(10..=20);

    assert_eq!(range.next().map(|(key, _)| *key), Some(10));
    assert_eq!(range.next_back().map(|(key, _)| *key), Some(20));
    let middle: Vec<i64> = range.map(|(key, _)| *key).collect();
    assert_eq!(middle, (11..=19).collect::<Vec<i64>>());
}

#[rstest]
fn test_borrowed_key_lookups() {
    let map = PersistentSortedMap::new()
        .insert("apple".to_string(), 1)
        .insert("banana".to_string(), 2);

    assert_eq!(map.get("apple"), Some(&1));
    assert!(map.contains_key("banana"));
    assert_eq!(map.range("b".to_string().."c".to_string()).count(), 1);
}

// =============================================================================
// Min / Max Tests
// =============================================================================

#[rstest]
fn test_min_and_max() {
    let map: PersistentSortedMap<i64, i64> = (0..500).map(|key| (key, key)).collect();
    assert_eq!(map.min(), Some((&0, &0)));
    assert_eq!(map.max(), Some((&499, &499)));
}

// =============================================================================
// Immutability Tests
// =============================================================================

#[rstest]
fn test_every_operation_preserves_prior_observations() {
    let map: PersistentSortedMap<i64, i64> = (0..200).map(|key| (key, key)).collect();
    let snapshot: Vec<(i64, i64)> = map.iter().map(|(key, value)| (*key, *value)).collect();

    let _ = map.insert(500, 500);
    let _ = map.remove(&100);
    let _ = map.range(50..150).count();

    let after: Vec<(i64, i64)> = map.iter().map(|(key, value)| (*key, *value)).collect();
    assert_eq!(snapshot, after);
}

#[rstest]
fn test_versions_diverge_independently() {
    let base: PersistentSortedMap<i64, i64> = (0..100).map(|key| (key, key)).collect();
    let with_insert = base.insert(200, 200);
    let with_remove = base.remove(&50);

    assert_eq!(base.len(), 100);
    assert_eq!(with_insert.len(), 101);
    assert_eq!(with_remove.len(), 99);
    assert_eq!(base.get(&50), Some(&50));
    assert_eq!(with_remove.get(&50), None);
    assert_eq!(with_insert.get(&200), Some(&200));
}
