//! Interval set tests.

use super::intervals::IntervalSet;

fn contents(set: &IntervalSet) -> Vec<(u32, u32)> {
    set.intervals().collect()
}

#[test]
fn test_disjoint_inserts_stay_separate() {
    let mut set = IntervalSet::new();
    assert_eq!(set.emplace_merge(10, 20), 20);
    assert_eq!(set.emplace_merge(30, 40), 40);
    assert_eq!(contents(&set), vec![(10, 20), (30, 40)]);
}

#[test]
fn test_overlap_coalesces() {
    let mut set = IntervalSet::new();
    set.emplace_merge(10, 20);
    assert_eq!(set.emplace_merge(15, 25), 25);
    assert_eq!(contents(&set), vec![(10, 25)]);
}

#[test]
fn test_touching_intervals_coalesce() {
    let mut set = IntervalSet::new();
    set.emplace_merge(10, 20);
    assert_eq!(set.emplace_merge(20, 30), 30);
    assert_eq!(set.emplace_merge(5, 10), 30);
    assert_eq!(contents(&set), vec![(5, 30)]);
}

#[test]
fn test_insert_bridging_two_intervals() {
    let mut set = IntervalSet::new();
    set.emplace_merge(10, 20);
    set.emplace_merge(30, 40);
    // [18, 32) overlaps both: everything collapses into one interval.
    assert_eq!(set.emplace_merge(18, 32), 40);
    assert_eq!(contents(&set), vec![(10, 40)]);
}

#[test]
fn test_contained_interval_is_absorbed() {
    let mut set = IntervalSet::new();
    set.emplace_merge(10, 40);
    assert_eq!(set.emplace_merge(15, 20), 40);
    assert_eq!(contents(&set), vec![(10, 40)]);
}

#[test]
fn test_no_overlapping_or_touching_after_merges() {
    let mut set = IntervalSet::new();
    for &(b, e) in &[(50u32, 60u32), (10, 20), (30, 40), (20, 30), (5, 10)] {
        set.emplace_merge(b, e);
    }
    let intervals = contents(&set);
    for pair in intervals.windows(2) {
        assert!(pair[0].1 < pair[1].0, "intervals {pair:?} overlap or touch");
    }
    assert_eq!(intervals, vec![(5, 40), (50, 60)]);
}

#[test]
fn test_merge_remove_returns_cluster_end_and_deletes() {
    let mut set = IntervalSet::new();
    set.emplace_merge(1101, 1151); // early arrival waiting for 1001..1101

    // The in-order write [1001, 1101) merges with the early arrival; the
    // whole cluster is consumed and its right edge is the new NXT.
    assert_eq!(set.merge_remove(1001, 1101), 1151);
    assert!(set.is_empty());
}

#[test]
fn test_merge_remove_without_neighbors() {
    let mut set = IntervalSet::new();
    assert_eq!(set.merge_remove(100, 150), 150);
    assert!(set.is_empty());
}

#[test]
fn test_merge_remove_leaves_disjoint_intervals() {
    let mut set = IntervalSet::new();
    set.emplace_merge(200, 250); // still out of order after the merge below
    set.emplace_merge(100, 120);

    assert_eq!(set.merge_remove(90, 100), 120);
    assert_eq!(contents(&set), vec![(200, 250)]);
}
