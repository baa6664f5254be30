//! Address interval index
//!
//! A flat interval tree: intervals sorted by low bound, with a parallel
//! max-high array over the implicit balanced BST the sorted order defines.
//! Build is O(n log n), a point stab is O(log n + k), and the structure is
//! two contiguous vectors.

/// A closed address range `[low, high]` tagged with an owner index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub low: u64,
    pub high: u64,
    /// Index into the owning symbol vector.
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct IntervalTree {
    ivals: Vec<Interval>,
    /// max high over the implicit subtree rooted at each position.
    max: Vec<u64>,
}

impl IntervalTree {
    pub fn build(mut ivals: Vec<Interval>) -> Self {
        ivals.sort_by(|a, b| a.low.cmp(&b.low).then(a.high.cmp(&b.high)));
        let mut max = vec![0u64; ivals.len()];
        if !ivals.is_empty() {
            let hi = ivals.len() - 1;
            compute_max(&ivals, &mut max, 0, hi);
        }
        Self { ivals, max }
    }

    pub fn len(&self) -> usize {
        self.ivals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ivals.is_empty()
    }

    /// All intervals containing `point`, in ascending low order.
    pub fn stab(&self, point: u64) -> Vec<Interval> {
        let mut out = Vec::new();
        if !self.ivals.is_empty() {
            self.stab_range(point, 0, self.ivals.len() - 1, &mut out);
        }
        out
    }

    fn stab_range(&self, point: u64, lo: usize, hi: usize, out: &mut Vec<Interval>) {
        let mid = lo + (hi - lo) / 2;
        // Nothing in this subtree reaches the point.
        if self.max[mid] < point {
            return;
        }
        if mid > lo {
            self.stab_range(point, lo, mid - 1, out);
        }
        let ival = self.ivals[mid];
        if ival.low <= point && point <= ival.high {
            out.push(ival);
        }
        // Everything to the right starts at or above ivals[mid].low.
        if mid < hi && point >= ival.low {
            self.stab_range(point, mid + 1, hi, out);
        }
    }
}

fn compute_max(ivals: &[Interval], max: &mut [u64], lo: usize, hi: usize) -> u64 {
    let mid = lo + (hi - lo) / 2;
    let mut m = ivals[mid].high;
    if mid > lo {
        m = m.max(compute_max(ivals, max, lo, mid - 1));
    }
    if mid < hi {
        m = m.max(compute_max(ivals, max, mid + 1, hi));
    }
    max[mid] = m;
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(spans: &[(u64, u64)]) -> IntervalTree {
        IntervalTree::build(
            spans
                .iter()
                .enumerate()
                .map(|(index, &(low, high))| Interval { low, high, index })
                .collect(),
        )
    }

    #[test]
    fn stab_hits_closed_boundaries() {
        let t = tree(&[(0x0800_0100, 0x0800_013f)]);
        assert_eq!(t.stab(0x0800_0100).len(), 1);
        assert_eq!(t.stab(0x0800_0120).len(), 1);
        assert_eq!(t.stab(0x0800_013f).len(), 1);
        assert!(t.stab(0x0800_0140).is_empty());
        assert!(t.stab(0x0800_00ff).is_empty());
    }

    #[test]
    fn overlapping_intervals_all_reported() {
        // A function containing a local literal-pool object, plus a neighbor.
        let t = tree(&[(0x100, 0x1ff), (0x180, 0x18f), (0x200, 0x2ff)]);
        let hits = t.stab(0x185);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 0);
        assert_eq!(hits[1].index, 1);
        assert_eq!(t.stab(0x250).len(), 1);
    }

    #[test]
    fn empty_tree_stabs_nothing() {
        let t = IntervalTree::build(Vec::new());
        assert!(t.stab(0).is_empty());
    }

    #[test]
    fn unsorted_input_is_handled() {
        let t = tree(&[(0x300, 0x3ff), (0x100, 0x1ff), (0x200, 0x2ff)]);
        let hits = t.stab(0x150);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].low, 0x100);
    }

    #[test]
    fn dense_tree_agrees_with_linear_scan() {
        let spans: Vec<(u64, u64)> = (0..200u64).map(|i| (i * 16, i * 16 + 31)).collect();
        let t = tree(&spans);
        for point in [0u64, 17, 40, 1000, 3199, 3200] {
            let expected: Vec<usize> = spans
                .iter()
                .enumerate()
                .filter(|(_, &(l, h))| l <= point && point <= h)
                .map(|(i, _)| i)
                .collect();
            let got: Vec<usize> = t.stab(point).iter().map(|iv| iv.index).collect();
            assert_eq!(got, expected, "point {:#x}", point);
        }
    }
}
