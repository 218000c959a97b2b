//! Cumulative-distribution sampling of vertex indices. A CDF over per-vertex
//! weights is walked with a fixed increment from a random phase, yielding
//! approximately `1/incr` draws distributed like the weights.

use rayon::prelude::*;

/// Builds a normalized CDF over `weights`. Returns `None` when the total
/// weight vanishes (nothing can be sampled). The last entry is exactly 1.0.
pub fn make_cdf(weights: &[f64]) -> Option<Vec<f64>> {
    let total: f64 = weights.par_iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return None;
    }

    let mut cdf = Vec::with_capacity(weights.len());
    let mut acc = 0.0;
    for &w in weights {
        acc += w;
        cdf.push(acc / total);
    }
    if let Some(last) = cdf.last_mut() {
        *last = 1.0;
    }
    Some(cdf)
}

/// The smallest index `i` with `cdf[i] > v`. `v` must lie in `[0, 1)`.
pub fn lookup(cdf: &[f64], v: f64) -> usize {
    cdf.partition_point(|&c| c <= v).min(cdf.len() - 1)
}
