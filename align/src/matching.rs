//! Correspondence generation: draw sample vertices through the CDF, find
//! their nearest neighbors in the other set and emit world-space point pairs.

use common::{math, PointCloud};
use nalgebra::{Matrix4, Point3, Vector3};
use rand::{rngs::StdRng, Rng};

use crate::kdtree::KdTree;
use crate::sample;

/// One correspondence, in world coordinates. `n2` is flipped on construction
/// so that `n1 . n2 >= 0`.
#[derive(Debug, Clone, Copy)]
pub struct PtPair {
    pub p1: Point3<f64>,
    pub n1: Vector3<f64>,
    pub p2: Point3<f64>,
    pub n2: Vector3<f64>,
}

/// Draws samples from `source` through `cdf` (one per `cdfincr` of
/// cumulative weight, starting at a random phase), matches each against
/// `target`'s k-d tree and appends the found pairs.
///
/// With `flip` set the roles in the emitted pairs are swapped so that slot 1
/// always holds the reference set when matching in the reverse direction.
#[allow(clippy::too_many_arguments)]
pub fn select_and_match(
    source: &PointCloud,
    target: &PointCloud,
    xf_source: &Matrix4<f64>,
    xf_target: &Matrix4<f64>,
    tree: &KdTree,
    cdf: &[f64],
    cdfincr: f64,
    maxdist: f64,
    normdot_thresh: f64,
    use_norm_compat: bool,
    reject_boundary: bool,
    flip: bool,
    rng: &mut StdRng,
    pairs: &mut Vec<PtPair>,
) {
    let Some(target_inv) = xf_target.try_inverse() else {
        return;
    };
    let xf_s2t = target_inv * xf_source;
    let nxf_s2t = math::normal_transform(&xf_s2t);
    let nxf_s = math::normal_transform(xf_source);
    let nxf_t = math::normal_transform(xf_target);

    // normals of a bare point cloud are not reliable enough to gate the
    // nearest-neighbor search with
    let gate_normals = use_norm_compat && !source.point_cloud && !target.point_cloud;
    let maxdist2 = maxdist * maxdist;

    let mut v = rng.gen_range(0.0..cdfincr);
    while v < 1.0 {
        let i = sample::lookup(cdf, v);
        v += cdfincr;

        let probe = xf_s2t.transform_point(&source.positions[i]);
        let hit = if gate_normals {
            let n_probe = (nxf_s2t * source.normals[i]).normalize();
            tree.nearest_with(&probe, maxdist2, |j| {
                n_probe.dot(&target.normals[j]) > normdot_thresh
            })
        } else {
            tree.nearest(&probe, maxdist2)
        };
        let Some(j) = hit else {
            continue;
        };
        if reject_boundary && target.is_boundary(j) {
            continue;
        }

        let ps = xf_source.transform_point(&source.positions[i]);
        let ns = (nxf_s * source.normals[i]).normalize();
        let pt = xf_target.transform_point(&target.positions[j]);
        let nt = (nxf_t * target.normals[j]).normalize();

        let (p1, n1, p2, mut n2) = if flip { (pt, nt, ps, ns) } else { (ps, ns, pt, nt) };
        if n1.dot(&n2) < 0.0 {
            n2 = -n2;
        }
        pairs.push(PtPair { p1, n1, p2, n2 });
    }
}
