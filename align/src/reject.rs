//! Adaptive outlier rejection. Per-iteration medians of the pair distances
//! and normal agreements drive the distance/angle thresholds used both to
//! prune the current pairs and to gate the next iteration's matching.

use crate::matching::PtPair;
use crate::IcpParams;

/// Thresholds derived from the current pair statistics.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub maxdist: f64,
    pub normdot: f64,
}

fn median(values: &mut [f64]) -> f64 {
    let mid = values.len() / 2;
    *values.select_nth_unstable_by(mid, f64::total_cmp).1
}

/// Computes median-based thresholds from the unpruned pairs, then drops every
/// pair beyond them. The returned thresholds also parameterize the next
/// iteration's matching. Callers must ensure `pairs` is non-empty.
pub fn update_and_prune(pairs: &mut Vec<PtPair>, params: &IcpParams) -> Thresholds {
    let mut dists: Vec<f64> = pairs.iter().map(|pr| (pr.p1 - pr.p2).norm()).collect();
    let mut dots: Vec<f64> = pairs.iter().map(|pr| pr.n1.dot(&pr.n2)).collect();

    let med_dist = median(&mut dists);
    let med_dot = median(&mut dots);

    let maxdist = params.dist_thresh_mult * med_dist;
    let normdot = (params.normdot_thresh_mult * med_dot.clamp(-1.0, 1.0).acos())
        .cos()
        .clamp(params.normdot_thresh_min, params.normdot_thresh_max);

    let maxdist2 = maxdist * maxdist;
    pairs.retain(|pr| {
        (pr.p1 - pr.p2).norm_squared() <= maxdist2 && pr.n1.dot(&pr.n2) >= normdot
    });

    Thresholds { maxdist, normdot }
}
