//! Ordered map from half-open `u64` intervals to values.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// A set of non-overlapping `[start, limit)` intervals, each carrying a
/// value.
///
/// Inserting over existing coverage overwrites it: intervals that straddle
/// the new boundaries are split and keep their value on the parts that
/// remain outside.
#[derive(Debug, Clone)]
pub struct IntervalMap<V> {
    /// start -> (limit, value)
    intervals: BTreeMap<u64, (u64, V)>,
}

impl<V> IntervalMap<V> {
    pub fn new() -> Self {
        Self {
            intervals: BTreeMap::new(),
        }
    }

    /// Value of the interval containing `key`.
    pub fn lookup(&self, key: u64) -> Option<&V> {
        self.lookup_interval(key).map(|(_, _, value)| value)
    }

    /// The interval containing `key` as `(start, limit, value)`.
    pub fn lookup_interval(&self, key: u64) -> Option<(u64, u64, &V)> {
        let (&start, (limit, value)) = self.intervals.range(..=key).next_back()?;
        (key < *limit).then_some((start, *limit, value))
    }

    /// The first interval starting strictly after `key`.
    pub fn find_next(&self, key: u64) -> Option<(u64, u64, &V)> {
        self.intervals
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(&start, (limit, value))| (start, *limit, value))
    }

    /// Number of stored intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Intervals in ascending start order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &V)> + '_ {
        self.intervals
            .iter()
            .map(|(&start, (limit, value))| (start, *limit, value))
    }

    /// Drop every interval starting in `[start, limit)`. Callers split the
    /// boundaries first so nothing dropped extends past `limit`.
    fn erase(&mut self, start: u64, limit: u64) {
        let keys: Vec<u64> = self.intervals.range(start..limit).map(|(&k, _)| k).collect();
        for key in keys {
            self.intervals.remove(&key);
        }
    }
}

impl<V: Clone> IntervalMap<V> {
    /// Map `[start, limit)` to `value`, overwriting existing coverage.
    ///
    /// # Panics
    ///
    /// Panics if `start >= limit`.
    pub fn set(&mut self, start: u64, limit: u64, value: V) {
        assert!(start < limit, "invalid interval [{start:#x}, {limit:#x})");
        // Both boundaries must be split before erasing, or the erase would
        // drop the outside parts of the intervals crossing them.
        self.split_at(limit);
        self.split_at(start);
        self.erase(start, limit);
        self.intervals.insert(start, (limit, value));
    }

    /// Remove coverage of `[start, limit)`, keeping the parts of boundary
    /// intervals that lie outside it.
    ///
    /// # Panics
    ///
    /// Panics if `start >= limit`.
    pub fn clear_interval(&mut self, start: u64, limit: u64) {
        assert!(start < limit, "invalid interval [{start:#x}, {limit:#x})");
        self.split_at(limit);
        self.split_at(start);
        self.erase(start, limit);
    }

    /// If an interval strictly contains `point`, cut it into
    /// `[start, point)` and `[point, limit)`, both with the original value.
    fn split_at(&mut self, point: u64) {
        let (start, limit, value) = match self.intervals.range(..point).next_back() {
            Some((&start, (limit, value))) if *limit > point => (start, *limit, value.clone()),
            _ => return,
        };
        self.intervals.insert(start, (point, value.clone()));
        self.intervals.insert(point, (limit, value));
    }
}

impl<V> Default for IntervalMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intervals(map: &IntervalMap<&'static str>) -> Vec<(u64, u64, &'static str)> {
        map.iter().map(|(s, l, v)| (s, l, *v)).collect()
    }

    fn assert_non_overlapping<V>(map: &IntervalMap<V>) {
        let mut previous_limit = 0;
        for (i, (start, limit, _)) in map.iter().enumerate() {
            assert!(start < limit);
            if i > 0 {
                assert!(start >= previous_limit, "overlap at {start:#x}");
            }
            previous_limit = limit;
        }
    }

    #[test]
    fn set_overwrites_upper_part() {
        let mut map = IntervalMap::new();
        map.set(5, 10, "A");
        map.set(8, 12, "B");

        assert_eq!(intervals(&map), vec![(5, 8, "A"), (8, 12, "B")]);
        for key in 5..8 {
            assert_eq!(map.lookup(key), Some(&"A"), "key {key}");
        }
        for key in 8..12 {
            assert_eq!(map.lookup(key), Some(&"B"), "key {key}");
        }
        for key in [3, 4, 12, 13] {
            assert_eq!(map.lookup(key), None, "key {key}");
        }
    }

    #[test]
    fn set_inside_splits_in_three() {
        let mut map = IntervalMap::new();
        map.set(4, 11, "Added");
        map.set(6, 9, "Overwrite");

        assert_eq!(map.len(), 3);
        assert_eq!(
            intervals(&map),
            vec![(4, 6, "Added"), (6, 9, "Overwrite"), (9, 11, "Added")]
        );
    }

    #[test]
    fn set_covering_several_intervals_replaces_them() {
        let mut map = IntervalMap::new();
        map.set(0, 4, "a");
        map.set(4, 8, "b");
        map.set(8, 12, "c");
        map.set(2, 10, "x");

        assert_eq!(intervals(&map), vec![(0, 2, "a"), (2, 10, "x"), (10, 12, "c")]);
    }

    #[test]
    fn set_exact_match_replaces_value() {
        let mut map = IntervalMap::new();
        map.set(0x1000, 0x2000, "old");
        map.set(0x1000, 0x2000, "new");
        assert_eq!(intervals(&map), vec![(0x1000, 0x2000, "new")]);
    }

    #[test]
    fn find_next_walks_in_order() {
        let mut map = IntervalMap::new();
        map.set(5, 10, "A");
        map.set(15, 20, "B");

        assert_eq!(map.find_next(0), Some((5, 10, &"A")));
        assert_eq!(map.find_next(10), Some((15, 20, &"B")));
        assert_eq!(map.find_next(20), None);
    }

    #[test]
    fn clear_interval_splits_boundaries() {
        let mut map = IntervalMap::new();
        map.set(0, 10, "A");
        map.set(10, 20, "B");
        map.clear_interval(5, 15);

        assert_eq!(intervals(&map), vec![(0, 5, "A"), (15, 20, "B")]);
        assert_eq!(map.lookup(7), None);
        assert_eq!(map.lookup(12), None);
        assert_eq!(map.lookup(4), Some(&"A"));
        assert_eq!(map.lookup(15), Some(&"B"));
    }

    #[test]
    fn clear_interval_in_gap_is_harmless() {
        let mut map = IntervalMap::new();
        map.set(0, 10, "A");
        map.clear_interval(20, 30);
        assert_eq!(intervals(&map), vec![(0, 10, "A")]);
    }

    #[test]
    fn high_addresses_work() {
        let mut map = IntervalMap::new();
        map.set(0xffff_ffff_8100_0000, u64::MAX, "kernel");
        assert_eq!(map.lookup(0xffff_ffff_8123_4567), Some(&"kernel"));
        assert_eq!(map.lookup(u64::MAX), None);
    }

    #[test]
    #[should_panic(expected = "invalid interval")]
    fn empty_interval_panics() {
        let mut map = IntervalMap::new();
        map.set(10, 10, "A");
    }

    #[test]
    #[should_panic(expected = "invalid interval")]
    fn inverted_interval_panics() {
        let mut map: IntervalMap<u32> = IntervalMap::new();
        map.clear_interval(10, 5);
    }

    #[test]
    fn random_operations_match_a_flat_model() {
        // Compare against a per-key model over a small domain.
        const DOMAIN: u64 = 64;
        let mut map = IntervalMap::new();
        let mut model: Vec<Option<u32>> = vec![None; DOMAIN as usize];
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for step in 0..2000u32 {
            let a = next() % DOMAIN;
            let b = next() % DOMAIN;
            let (start, limit) = if a == b { (a, a + 1) } else { (a.min(b), a.max(b)) };
            if next() % 4 == 0 {
                map.clear_interval(start, limit);
                for key in start..limit {
                    model[key as usize] = None;
                }
            } else {
                map.set(start, limit, step);
                for key in start..limit {
                    model[key as usize] = Some(step);
                }
            }

            assert_non_overlapping(&map);
            for key in 0..DOMAIN {
                assert_eq!(map.lookup(key).copied(), model[key as usize], "key {key}");
            }
        }
    }
}
