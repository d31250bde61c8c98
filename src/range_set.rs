use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::ops::Range;

/// A set of disjoint, non-adjacent half-open ranges, keyed by start
#[derive(Clone, Default, Eq, PartialEq)]
pub struct RangeSet {
    ranges: BTreeMap<u64, u64>,
}
impl Debug for RangeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter())
            .finish()
    }
}

impl RangeSet {
    pub fn new() -> RangeSet {
        RangeSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// total number of values in all ranges
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter()
            .map(|(start, end)| end - start)
            .sum()
    }

    pub fn contains(&self, value: u64) -> bool {
        self.ranges.range(..=value).next_back()
            .map(|(_, &end)| value < end)
            .unwrap_or(false)
    }

    pub fn first(&self) -> Option<Range<u64>> {
        self.ranges.first_key_value()
            .map(|(&start, &end)| start..end)
    }

    pub fn last(&self) -> Option<Range<u64>> {
        self.ranges.last_key_value()
            .map(|(&start, &end)| start..end)
    }

    /// ascending order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.ranges.iter()
            .map(|(&start, &end)| start..end)
    }

    /// Adds a range, merging it with all ranges it overlaps or touches
    pub fn insert(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        let mut start = range.start;
        let mut end = range.end;

        let touching: Vec<(u64, u64)> = self.ranges.range(..=end).rev()
            .take_while(|(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in touching {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    pub fn remove(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        let overlapping: Vec<(u64, u64)> = self.ranges.range(..range.end).rev()
            .take_while(|(_, &e)| e > range.start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < range.start {
                self.ranges.insert(s, range.start);
            }
            if e > range.end {
                self.ranges.insert(range.end, e);
            }
        }
    }

    /// Removes and returns the lowest range
    pub fn pop_first(&mut self) -> Option<Range<u64>> {
        self.ranges.pop_first()
            .map(|(start, end)| start..end)
    }

    /// Removes the lowest ranges until at most `max_ranges` are left
    pub fn retain_highest(&mut self, max_ranges: usize) {
        while self.ranges.len() > max_ranges {
            self.ranges.pop_first();
        }
    }
}
