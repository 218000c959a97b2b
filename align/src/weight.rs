//! Eigen-directed importance reweighting. After a solve, every vertex is
//! scored by how much it would constrain the directions the current system
//! resolves poorly; the scores (times the sticky per-vertex weights) become
//! the sampling CDF for the following iterations.

use common::{math, PointCloud};
use itertools::izip;
use nalgebra::{Matrix4, Point3, Vector6};
use rayon::prelude::*;

use crate::sample;
use crate::solve::EigenSystem;

/// Builds the next sampling CDF for one set. `sqrt(einv)` steers sampling
/// towards poorly constrained eigen-directions without degenerating when one
/// direction is nearly singular. Returns `None` when every product weight is
/// zero (no usable overlap).
pub fn importance_cdf(
    set: &PointCloud,
    xf: &Matrix4<f64>,
    scale: f64,
    centroid: &Point3<f64>,
    eig: &EigenSystem,
    weights: &[f64],
) -> Option<Vec<f64>> {
    let nxf = math::normal_transform(xf);
    let sqrt_einv = eig.einv.map(f64::sqrt);

    let scores: Vec<f64> = set
        .positions
        .par_iter()
        .zip(&set.normals)
        .map(|(pos, nrm)| {
            // the factor 2 matches the p1+p2 convention of the solver
            let p = (xf.transform_point(pos) - centroid) * (2.0 * scale);
            let n = nxf * nrm;
            let c = p.cross(&n);
            let x = Vector6::new(c.x, c.y, c.z, n.x, n.y, n.z);
            let proj = eig.evec.tr_mul(&x);
            proj.zip_map(&sqrt_einv, |pj, si| si * pj * pj).sum()
        })
        .collect();

    let combined: Vec<f64> = izip!(&scores, weights).map(|(s, w)| s * w).collect();
    sample::make_cdf(&combined)
}
