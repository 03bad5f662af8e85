//! Time-range selections
//!
//! A selection is a sorted list of disjoint inclusive ranges `[begin, end]`.
//! The empty selection includes every timestamp.

use tracefold_capture::Timestamp;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    ranges: Vec<(Timestamp, Timestamp)>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(Timestamp, Timestamp)] {
        &self.ranges
    }

    /// Add `[begin, end]`, merging with any range it overlaps or adjoins
    pub fn select_range(&mut self, begin: Timestamp, end: Timestamp) {
        let (mut begin, mut end) = (begin.min(end), begin.max(end));

        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for &(b, e) in &self.ranges {
            if e.saturating_add(1) < begin || b > end.saturating_add(1) {
                kept.push((b, e));
            } else {
                begin = begin.min(b);
                end = end.max(e);
            }
        }
        kept.push((begin, end));
        kept.sort_unstable();
        self.ranges = kept;
    }

    /// Remove `[begin, end]`, splitting any range it cuts through
    pub fn unselect_range(&mut self, begin: Timestamp, end: Timestamp) {
        let (begin, end) = (begin.min(end), begin.max(end));

        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for &(b, e) in &self.ranges {
            if e < begin || b > end {
                kept.push((b, e));
                continue;
            }
            if b < begin {
                kept.push((b, begin - 1));
            }
            if e > end {
                kept.push((end + 1, e));
            }
        }
        self.ranges = kept;
    }

    pub fn unselect_all(&mut self) {
        self.ranges.clear();
    }

    pub fn contains(&self, time: Timestamp) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        let idx = self.ranges.partition_point(|(begin, _)| *begin <= time);
        self.ranges[..idx].last().is_some_and(|(_, end)| time <= *end)
    }
}
