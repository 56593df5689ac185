use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Off,
    #[default]
    Normal,
    High,
}

/// Sorted, disjoint, half-open `[begin, end)` ranges of chunk indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranges {
    ranges: Vec<(u32, u32)>,
}

impl Ranges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_range(begin: u32, end: u32) -> Self {
        let mut r = Self::default();
        r.insert(begin, end);
        r
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn clear(&mut self) {
        self.ranges.clear()
    }

    /// Total count of indices covered.
    pub fn intersect_distance(&self, begin: u32, end: u32) -> u32 {
        self.ranges
            .iter()
            .map(|(b, e)| {
                let b = (*b).max(begin);
                let e = (*e).min(end);
                e.saturating_sub(b)
            })
            .sum()
    }

    pub fn has(&self, index: u32) -> bool {
        // First range whose end is past index.
        let pos = self.ranges.partition_point(|(_, e)| *e <= index);
        self.ranges
            .get(pos)
            .map(|(b, _)| *b <= index)
            .unwrap_or(false)
    }

    pub fn insert(&mut self, begin: u32, end: u32) {
        if begin >= end {
            return;
        }
        // Ranges touching or overlapping [begin, end) get merged into it.
        let first = self.ranges.partition_point(|(_, e)| *e < begin);
        let last = self.ranges.partition_point(|(b, _)| *b <= end);
        let mut new_begin = begin;
        let mut new_end = end;
        if first < last {
            new_begin = new_begin.min(self.ranges[first].0);
            new_end = new_end.max(self.ranges[last - 1].1);
        }
        self.ranges
            .splice(first..last, std::iter::once((new_begin, new_end)));
    }

    pub fn erase(&mut self, begin: u32, end: u32) {
        if begin >= end {
            return;
        }
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for (b, e) in self.ranges.drain(..) {
            if e <= begin || b >= end {
                result.push((b, e));
                continue;
            }
            if b < begin {
                result.push((b, begin));
            }
            if e > end {
                result.push((end, e));
            }
        }
        self.ranges = result;
    }

    /// Sub-ranges falling inside `[begin, end)`, in order.
    pub fn iter_within(&self, begin: u32, end: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.ranges.iter().filter_map(move |(b, e)| {
            let b = (*b).max(begin);
            let e = (*e).min(end);
            (b < e).then_some((b, e))
        })
    }
}

/// Which chunks are wanted, and how urgently. Anything not in either set is
/// [`Priority::Off`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRanges {
    pub normal: Ranges,
    pub high: Ranges,
}

impl PriorityRanges {
    /// Everything in `[0, size)` at normal priority.
    pub fn all_normal(size: u32) -> Self {
        Self {
            normal: Ranges::from_range(0, size),
            high: Ranges::new(),
        }
    }

    pub fn priority_of(&self, index: u32) -> Priority {
        if self.high.has(index) {
            Priority::High
        } else if self.normal.has(index) {
            Priority::Normal
        } else {
            Priority::Off
        }
    }

    pub fn is_wanted(&self, index: u32) -> bool {
        self.priority_of(index) != Priority::Off
    }

    pub fn set(&mut self, begin: u32, end: u32, priority: Priority) {
        self.high.erase(begin, end);
        self.normal.erase(begin, end);
        match priority {
            Priority::Off => {}
            Priority::Normal => self.normal.insert(begin, end),
            Priority::High => self.high.insert(begin, end),
        }
    }

    pub fn get(&self, priority: Priority) -> Option<&Ranges> {
        match priority {
            Priority::Off => None,
            Priority::Normal => Some(&self.normal),
            Priority::High => Some(&self.high),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges() {
        let mut r = Ranges::new();
        r.insert(10, 20);
        r.insert(30, 40);
        r.insert(20, 25);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![(10, 25), (30, 40)]);
        r.insert(5, 35);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![(5, 40)]);
        r.insert(50, 50);
        assert_eq!(r.iter().count(), 1);
    }

    #[test]
    fn test_erase_splits() {
        let mut r = Ranges::from_range(0, 100);
        r.erase(10, 20);
        r.erase(90, 200);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![(0, 10), (20, 90)]);
        assert!(r.has(0));
        assert!(r.has(9));
        assert!(!r.has(10));
        assert!(!r.has(19));
        assert!(r.has(20));
        assert!(!r.has(90));
        assert_eq!(r.intersect_distance(5, 25), 10);
    }

    #[test]
    fn test_iter_within() {
        let mut r = Ranges::new();
        r.insert(0, 5);
        r.insert(10, 15);
        assert_eq!(
            r.iter_within(3, 12).collect::<Vec<_>>(),
            vec![(3, 5), (10, 12)]
        );
    }

    #[test]
    fn test_priority_ranges() {
        let mut p = PriorityRanges::all_normal(100);
        p.set(0, 10, Priority::High);
        p.set(90, 100, Priority::Off);
        assert_eq!(p.priority_of(5), Priority::High);
        assert_eq!(p.priority_of(50), Priority::Normal);
        assert_eq!(p.priority_of(95), Priority::Off);
        assert!(!p.is_wanted(95));
    }
}
