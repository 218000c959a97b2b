//! A k-d tree over vertex positions that returns vertex *indices*. Queries
//! take a squared-distance cutoff and, optionally, a per-candidate acceptance
//! predicate; when the nearest candidate is rejected the search keeps
//! descending into sibling subtrees.

use nalgebra::Point3;

#[derive(Clone, Copy)]
struct Entry {
    pos: Point3<f64>,
    index: u32,
}

/// Balanced median-split k-d tree stored as an implicit binary tree: the node
/// of a segment sits at its midpoint, children are the two halves.
pub struct KdTree {
    entries: Vec<Entry>,
    axes: Vec<u8>,
}

impl KdTree {
    pub fn build(positions: &[Point3<f64>]) -> Self {
        let mut entries: Vec<Entry> = positions
            .iter()
            .enumerate()
            .map(|(i, p)| Entry {
                pos: *p,
                index: i as u32,
            })
            .collect();
        let mut axes = vec![0u8; entries.len()];
        build_segment(&mut entries, &mut axes, 0);
        Self { entries, axes }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the nearest vertex within `max_sq_dist` (inclusive) of `p`.
    pub fn nearest(&self, p: &Point3<f64>, max_sq_dist: f64) -> Option<usize> {
        self.nearest_with(p, max_sq_dist, |_| true)
    }

    /// Like [`nearest`](Self::nearest), but only candidates for which
    /// `accept` returns true are eligible. Rejected candidates do not shrink
    /// the search radius.
    pub fn nearest_with(
        &self,
        p: &Point3<f64>,
        max_sq_dist: f64,
        accept: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let mut best = (max_sq_dist, None);
        self.search(0, self.entries.len(), p, &accept, &mut best);
        best.1.map(|i: u32| i as usize)
    }

    fn search(
        &self,
        lo: usize,
        hi: usize,
        p: &Point3<f64>,
        accept: &impl Fn(usize) -> bool,
        best: &mut (f64, Option<u32>),
    ) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let entry = &self.entries[mid];

        let d2 = (entry.pos - p).norm_squared();
        if d2 <= best.0 && accept(entry.index as usize) {
            *best = (d2, Some(entry.index));
        }

        let axis = self.axes[mid] as usize;
        let delta = p[axis] - entry.pos[axis];
        let (near, far) = if delta < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };
        self.search(near.0, near.1, p, accept, best);
        // the far side can only help if the splitting plane is in range
        if delta * delta <= best.0 {
            self.search(far.0, far.1, p, accept, best);
        }
    }
}

fn build_segment(entries: &mut [Entry], axes: &mut [u8], depth: usize) {
    if entries.is_empty() {
        return;
    }
    let axis = depth % 3;
    let mid = entries.len() / 2;
    entries.select_nth_unstable_by(mid, |a, b| a.pos[axis].total_cmp(&b.pos[axis]));
    axes[mid] = axis as u8;

    let (left, rest) = entries.split_at_mut(mid);
    let (left_axes, rest_axes) = axes.split_at_mut(mid);
    build_segment(left, left_axes, depth + 1);
    build_segment(&mut rest[1..], &mut rest_axes[1..], depth + 1);
}
