use crate::partition::{node_range, partition};
use proptest::prelude::*;

#[test]
pub fn eleven_over_three() {
    assert_eq!(partition(11, 3), vec![0..4, 4..8, 8..11]);
}

#[test]
pub fn even_split() {
    assert_eq!(partition(8, 4), vec![0..2, 2..4, 4..6, 6..8]);
}

#[test]
pub fn more_parts_than_items() {
    assert_eq!(partition(2, 3), vec![0..1, 1..2, 2..2]);
    assert_eq!(partition(0, 1), vec![0..0]);
}

#[test]
pub fn no_parts() {
    assert!(partition(5, 0).is_empty());
}

#[test]
pub fn node_lookup() {
    assert_eq!(node_range(11, 3, 2), Some(8..11));
    assert_eq!(node_range(11, 3, 3), None);
}

proptest! {
    #[test]
    fn ranges_cover_total_exactly_once(total in 0usize..500, extra in 0usize..50) {
        let parts = 1 + extra.min(total);
        let ranges = partition(total, parts);

        prop_assert_eq!(ranges.len(), parts);
        let mut expected_start = 0;
        for range in ranges.iter() {
            prop_assert_eq!(range.start, expected_start);
            prop_assert!(range.start <= range.end);
            expected_start = range.end;
        }
        prop_assert_eq!(expected_start, total);
    }

    #[test]
    fn ranges_are_balanced(total in 0usize..500, parts in 1usize..64) {
        let lengths: Vec<usize> = partition(total, parts).iter().map(|range| range.len()).collect();
        let min = lengths.iter().copied().min().unwrap_or(0);
        let max = lengths.iter().copied().max().unwrap_or(0);

        prop_assert!(max - min <= 1);
        // longer ranges come first
        prop_assert!(lengths.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    #[test]
    fn partition_is_deterministic(total in 0usize..500, parts in 1usize..64) {
        prop_assert_eq!(partition(total, parts), partition(total, parts));
    }
}
