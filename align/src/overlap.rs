//! Per-vertex overlap indicators: does a vertex of one set land inside the
//! other set's support after both placements are applied?

use common::PointCloud;
use nalgebra::{Matrix4, Point3};
use rayon::prelude::*;

use crate::grid::OccGrid;
use crate::kdtree::KdTree;

/// Fills `w1`/`w2` with 0/1 indicators: 1.0 iff the vertex, transformed into
/// the other set's frame, lies inside that set's dilated grid and has a
/// neighbor within `maxdist`. A non-positive `maxdist` is replaced by the
/// smaller of the two grid bbox sizes.
#[allow(clippy::too_many_arguments)]
pub fn compute_overlaps(
    set1: &PointCloud,
    set2: &PointCloud,
    xf1: &Matrix4<f64>,
    xf2: &Matrix4<f64>,
    kd1: &KdTree,
    kd2: &KdTree,
    grid1: &OccGrid,
    grid2: &OccGrid,
    w1: &mut Vec<f64>,
    w2: &mut Vec<f64>,
    maxdist: f64,
) {
    let maxdist = if maxdist > 0.0 {
        maxdist
    } else {
        grid1.bbox_size().min(grid2.bbox_size())
    };
    let maxdist2 = maxdist * maxdist;

    let (Some(inv1), Some(inv2)) = (xf1.try_inverse(), xf2.try_inverse()) else {
        return;
    };
    let xf_12 = inv2 * xf1; // set1 local -> set2 local
    let xf_21 = inv1 * xf2;

    let indicator = |p: Point3<f64>, grid: &OccGrid, kd: &KdTree| -> f64 {
        if grid.overlaps(&p) && kd.nearest(&p, maxdist2).is_some() {
            1.0
        } else {
            0.0
        }
    };

    *w1 = set1
        .positions
        .par_iter()
        .map(|p| indicator(xf_12.transform_point(p), grid2, kd2))
        .collect();
    *w2 = set2
        .positions
        .par_iter()
        .map(|p| indicator(xf_21.transform_point(p), grid1, kd1))
        .collect();
}
