//! The iteration engine: runs matching, rejection, solving and reweighting
//! until convergence, promotes the transform type halfway through for
//! similarity/affine requests, and finishes with denser refinement passes.

use std::time::Instant;

use common::{math, PointCloud};
use nalgebra::Matrix4;
use rand::{rngs::StdRng, SeedableRng};

use crate::grid::OccGrid;
use crate::kdtree::KdTree;
use crate::matching::{select_and_match, PtPair};
use crate::overlap::compute_overlaps;
use crate::reject::update_and_prune;
use crate::sample::make_cdf;
use crate::solve;
use crate::weight::importance_cdf;
use crate::{IcpError, IcpParams, XformType};

/// Inputs that stay fixed for the duration of one call.
struct Workspace<'a> {
    set1: &'a PointCloud,
    set2: &'a PointCloud,
    kd1: &'a KdTree,
    kd2: &'a KdTree,
    params: &'a IcpParams,
}

/// Mutable per-call state threaded through the iterations.
struct IterState {
    maxdist: f64,
    normdot: f64,
    cdfincr: f64,
    cdf1: Vec<f64>,
    cdf2: Vec<f64>,
    rng: StdRng,
}

#[allow(clippy::too_many_arguments)]
pub fn icp_core(
    set1: &PointCloud,
    set2: &PointCloud,
    xf1: &Matrix4<f64>,
    xf2: &mut Matrix4<f64>,
    kd1: &KdTree,
    kd2: &KdTree,
    grid1: &OccGrid,
    grid2: &OccGrid,
    weights1: &mut Vec<f64>,
    weights2: &mut Vec<f64>,
    synthesized_weights: bool,
    maxdist: f64,
    xform_type: XformType,
    params: &IcpParams,
) -> Result<f64, IcpError> {
    let ws = Workspace {
        set1,
        set2,
        kd1,
        kd2,
        params,
    };
    let mut st = IterState {
        maxdist: if maxdist > 0.0 {
            maxdist
        } else {
            grid1.bbox_size().min(grid2.bbox_size())
        },
        normdot: params.normdot_thresh_min,
        cdfincr: 2.0 / params.desired_pairs as f64,
        cdf1: make_cdf(weights1).ok_or(IcpError::NoOverlap)?,
        cdf2: make_cdf(weights2).ok_or(IcpError::NoOverlap)?,
        rng: match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        },
    };

    let mut iter_xform = match xform_type {
        XformType::Translation => XformType::Translation,
        _ => XformType::Rigid,
    };

    // a first pass at uniform sampling to get thresholds off the ground
    let mut last_err = icp_iter(
        &ws,
        &mut st,
        xf1,
        xf2,
        weights1,
        weights2,
        iter_xform,
        xform_type,
        false,
        params.desired_pairs,
    )?;

    let update_interval = params.cdf_update_interval.max(1);
    let mut min_err = f64::INFINITY;
    let mut stagnant = 0usize;

    for iter in 0..params.max_iters {
        let recompute = iter % update_interval == 0;
        if recompute {
            if iter != 0 && synthesized_weights {
                compute_overlaps(
                    set1, set2, xf1, xf2, kd1, kd2, grid1, grid2, weights1, weights2, st.maxdist,
                );
            }
            st.cdf1 = make_cdf(weights1).ok_or(IcpError::NoOverlap)?;
            st.cdf2 = make_cdf(weights2).ok_or(IcpError::NoOverlap)?;
        }

        last_err = icp_iter(
            &ws,
            &mut st,
            xf1,
            xf2,
            weights1,
            weights2,
            iter_xform,
            xform_type,
            recompute,
            params.desired_pairs,
        )?;

        // recompute iterations sample uniformly, which biases the error
        // estimate, so they do not take part in the convergence tracking
        if !recompute {
            if last_err < min_err {
                min_err = last_err;
                stagnant = 0;
            } else {
                stagnant += 1;
            }
            if stagnant >= params.termination_iter_thresh
                && matches!(xform_type, XformType::Translation | XformType::Rigid)
            {
                if params.verbose > 1 {
                    tracing::debug!("converged after {} iterations", iter + 1);
                }
                break;
            }
        }

        // halfway through, scale/affine solves take over for the remaining
        // iterations
        if iter == params.max_iters / 2
            && matches!(xform_type, XformType::Similarity | XformType::Affine)
        {
            iter_xform = xform_type;
        }
    }

    // refinement passes at a denser sampling rate
    st.cdfincr *= params.desired_pairs as f64 / params.desired_pairs_final as f64;
    st.cdf1 = make_cdf(weights1).ok_or(IcpError::NoOverlap)?;
    st.cdf2 = make_cdf(weights2).ok_or(IcpError::NoOverlap)?;
    for _ in 0..params.final_iters {
        last_err = icp_iter(
            &ws,
            &mut st,
            xf1,
            xf2,
            weights1,
            weights2,
            iter_xform,
            xform_type,
            false,
            params.desired_pairs_final,
        )?;
    }

    Ok(last_err)
}

/// One matching / rejection / solve / apply round. Returns the RMS residual
/// of the surviving pairs under the freshly applied increment.
#[allow(clippy::too_many_arguments)]
fn icp_iter(
    ws: &Workspace<'_>,
    st: &mut IterState,
    xf1: &Matrix4<f64>,
    xf2: &mut Matrix4<f64>,
    weights1: &[f64],
    weights2: &[f64],
    iter_xform: XformType,
    xform_type: XformType,
    update_cdfs: bool,
    desired_pairs: usize,
) -> Result<f64, IcpError> {
    let params = ws.params;
    let start = Instant::now();

    let mut pairs: Vec<PtPair> = Vec::with_capacity(desired_pairs + desired_pairs / 4);
    select_and_match(
        ws.set1,
        ws.set2,
        xf1,
        xf2,
        ws.kd2,
        &st.cdf1,
        st.cdfincr,
        st.maxdist,
        st.normdot,
        params.use_norm_compat,
        params.reject_boundary,
        false,
        &mut st.rng,
        &mut pairs,
    );
    select_and_match(
        ws.set2,
        ws.set1,
        xf2,
        xf1,
        ws.kd1,
        &st.cdf2,
        st.cdfincr,
        st.maxdist,
        st.normdot,
        params.use_norm_compat,
        params.reject_boundary,
        true,
        &mut st.rng,
        &mut pairs,
    );
    let matched = pairs.len();
    let match_time = start.elapsed();

    if matched < params.min_pairs {
        return Err(IcpError::InsufficientPairs);
    }

    let thresholds = update_and_prune(&mut pairs, params);
    st.maxdist = thresholds.maxdist;
    st.normdot = thresholds.normdot;
    if pairs.len() < params.min_pairs {
        return Err(IcpError::InsufficientPairs);
    }
    // steer the sampling rate towards the desired pair count
    st.cdfincr *= pairs.len() as f64 / desired_pairs as f64;

    let (c1, c2, scale) = solve::centroids_and_scale(&pairs);
    let (alignxf, eig) = match iter_xform {
        XformType::Translation => {
            let xf = solve::align_translation(&pairs, scale, &c1, &c2, params.regularization);
            // the 6x6 eigensystem is still needed to steer the resampling
            let eig = update_cdfs.then(|| {
                solve::align_symmetric(&pairs, scale, &c1, &c2, params.regularization).eig
            });
            (xf, eig)
        }
        XformType::Rigid => {
            let alignment =
                solve::align_symmetric(&pairs, scale, &c1, &c2, params.regularization);
            (alignment.xf, Some(alignment.eig))
        }
        XformType::Similarity | XformType::Affine => {
            let alignment =
                solve::align_symmetric(&pairs, scale, &c1, &c2, params.regularization);
            let xf = solve::with_scale(
                &pairs,
                alignment.xf,
                &c1,
                &c2,
                iter_xform == XformType::Affine,
            );
            (xf, Some(alignment.eig))
        }
    };

    let err = solve::rms_error(&pairs, &alignxf);
    *xf2 = alignxf * *xf2;
    if xform_type == XformType::Rigid {
        math::orthogonalize(xf2);
    }

    if update_cdfs {
        if let Some(eig) = &eig {
            st.cdf1 = importance_cdf(ws.set1, xf1, scale, &c1, eig, weights1)
                .ok_or(IcpError::NoOverlap)?;
            st.cdf2 = importance_cdf(ws.set2, xf2, scale, &c2, eig, weights2)
                .ok_or(IcpError::NoOverlap)?;
        }
    }

    if params.verbose > 1 {
        tracing::debug!(
            "{matched} -> {} pairs, maxdist {:.4}, normdot {:.3}, err {:.6} ({:.1?} match, {:.1?} total)",
            pairs.len(),
            st.maxdist,
            st.normdot,
            err,
            match_time,
            start.elapsed(),
        );
    }

    Ok(err)
}
