//! Pairwise alignment of oriented point sets using Iterative Closest Point
//! with a symmetric point-to-plane objective. Inspiration and background:
//! * <https://www.cs.princeton.edu/~smr/papers/symicp/>
//!
//! Given two point sets and their initial placements, [`icp`] iteratively
//! refines the second placement so the sets line up under the requested
//! transform class (translation, rigid, similarity or affine).

mod grid;
mod iterate;
mod matching;
mod overlap;
mod reject;
mod sample;
mod solve;
mod weight;

pub mod kdtree;

use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use common::{Aabb, PointCloud};

use grid::OccGrid;
use kdtree::KdTree;

/// The class of transform the alignment is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XformType {
    /// Translation only.
    Translation,
    /// Rotation + translation.
    Rigid,
    /// Rigid + uniform scale.
    Similarity,
    /// Full affine.
    Affine,
}

/// Ways an alignment can fail. Temporary state is released and synthesized
/// weights are cleared on every failure path; the partially updated placement
/// is not rolled back and should be discarded by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IcpError {
    #[error("point set is empty")]
    EmptyPointSet,

    #[error("point set has no per-vertex normals")]
    MissingNormals,

    #[error("too few correspondences survived outlier rejection")]
    InsufficientPairs,

    #[error("the point sets do not overlap")]
    NoOverlap,
}

/// Tunables of the iteration engine. The defaults are the intended operating
/// point; tests override single values.
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct IcpParams {
    /// Cap on the main iteration loop.
    pub max_iters: usize,
    /// Number of consecutive iterations without a new error minimum before
    /// terminating (translation/rigid only).
    pub termination_iter_thresh: usize,
    /// Refinement passes run after the main loop at the denser sampling rate.
    pub final_iters: usize,
    /// Below this many surviving pairs an iteration gives up.
    pub min_pairs: usize,
    /// Target correspondence count of main-loop iterations.
    pub desired_pairs: usize,
    /// Target correspondence count of the final refinement passes.
    pub desired_pairs_final: usize,
    /// Cadence (in iterations) of overlap/importance reweighting.
    pub cdf_update_interval: usize,
    /// Drop matches that land on a mesh boundary vertex.
    pub reject_boundary: bool,
    /// Gate nearest-neighbor candidates on normal agreement (skipped when
    /// either set is a bare point cloud).
    pub use_norm_compat: bool,
    /// Huber knee of the IRLS weights; also the weight of the point-to-point
    /// regularization rows.
    pub regularization: f64,
    /// Distance rejection threshold as a multiple of the median distance.
    pub dist_thresh_mult: f64,
    /// Normal-angle rejection threshold as a multiple of the median angle.
    pub normdot_thresh_mult: f64,
    /// Clamp range for the normal-compatibility cosine threshold.
    pub normdot_thresh_min: f64,
    pub normdot_thresh_max: f64,
    /// Seed for the sampling phase; `None` draws from entropy.
    pub seed: Option<u64>,
    /// At values above 1, per-iteration progress is logged at debug level.
    pub verbose: u8,
}

impl Default for IcpParams {
    fn default() -> Self {
        Self {
            max_iters: 99,
            termination_iter_thresh: 11,
            final_iters: 2,
            min_pairs: 10,
            desired_pairs: 1000,
            desired_pairs_final: 5000,
            cdf_update_interval: 10,
            reject_boundary: false,
            use_norm_compat: true,
            regularization: 1e-3,
            dist_thresh_mult: 6.0,
            normdot_thresh_mult: 1.5,
            normdot_thresh_min: 0.5,
            normdot_thresh_max: 0.99,
            seed: None,
            verbose: 0,
        }
    }
}

/// Aligns `set2` to `set1` by refining `xf2` in place. Builds the k-d trees
/// itself and samples uniformly by overlap. Returns the RMS residual of the
/// final refinement pass.
pub fn icp(
    set1: &PointCloud,
    set2: &PointCloud,
    xf1: &Matrix4<f64>,
    xf2: &mut Matrix4<f64>,
    xform_type: XformType,
    params: IcpParams,
) -> Result<f64, IcpError> {
    let mut weights1 = Vec::new();
    let mut weights2 = Vec::new();
    icp_weighted(
        set1,
        set2,
        xf1,
        xf2,
        &mut weights1,
        &mut weights2,
        0.0,
        xform_type,
        params,
    )
}

/// Like [`icp`], with caller-controlled per-vertex sampling weights and an
/// initial match distance cap. Weight vectors whose lengths match the vertex
/// counts are used as-is (and kept); anything else is replaced by synthesized
/// weights that are cleared again before returning. `maxdist <= 0` derives
/// the cap from the bounding boxes.
#[allow(clippy::too_many_arguments)]
pub fn icp_weighted(
    set1: &PointCloud,
    set2: &PointCloud,
    xf1: &Matrix4<f64>,
    xf2: &mut Matrix4<f64>,
    weights1: &mut Vec<f64>,
    weights2: &mut Vec<f64>,
    maxdist: f64,
    xform_type: XformType,
    params: IcpParams,
) -> Result<f64, IcpError> {
    validate(set1)?;
    validate(set2)?;
    let (kd1, kd2) = rayon::join(
        || KdTree::build(&set1.positions),
        || KdTree::build(&set2.positions),
    );
    icp_with_trees(
        set1, set2, xf1, xf2, &kd1, &kd2, weights1, weights2, maxdist, xform_type, params,
    )
}

/// Like [`icp_weighted`], for callers that already maintain k-d trees over
/// the two vertex sets.
#[allow(clippy::too_many_arguments)]
pub fn icp_with_trees(
    set1: &PointCloud,
    set2: &PointCloud,
    xf1: &Matrix4<f64>,
    xf2: &mut Matrix4<f64>,
    kd1: &KdTree,
    kd2: &KdTree,
    weights1: &mut Vec<f64>,
    weights2: &mut Vec<f64>,
    maxdist: f64,
    xform_type: XformType,
    params: IcpParams,
) -> Result<f64, IcpError> {
    validate(set1)?;
    validate(set2)?;

    let (grid1, grid2) = rayon::join(
        || OccGrid::build(&set1.positions),
        || OccGrid::build(&set2.positions),
    );

    let synthesized = weights1.len() != set1.len() || weights2.len() != set2.len();
    if synthesized {
        weights1.clear();
        weights1.resize(set1.len(), 1.0);
        weights2.clear();
        weights2.resize(set2.len(), 1.0);
    }

    let result = iterate::icp_core(
        set1,
        set2,
        xf1,
        xf2,
        kd1,
        kd2,
        &grid1,
        &grid2,
        weights1,
        weights2,
        synthesized,
        maxdist,
        xform_type,
        &params,
    );

    if synthesized {
        weights1.clear();
        weights2.clear();
    }
    result
}

fn validate(set: &PointCloud) -> Result<(), IcpError> {
    if set.is_empty() {
        return Err(IcpError::EmptyPointSet);
    }
    if set.normals.len() != set.positions.len() {
        return Err(IcpError::MissingNormals);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use common::math;
    use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    /// Uniform random samples on the unit sphere with true outward normals,
    /// treated as mesh vertices so normal gating is active.
    fn sphere_cloud(n: usize, seed: u64) -> PointCloud {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut positions = Vec::with_capacity(n);
        let mut normals = Vec::with_capacity(n);
        for _ in 0..n {
            let z: f64 = rng.gen_range(-1.0..1.0);
            let theta: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
            let r = (1.0 - z * z).sqrt();
            let dir = Vector3::new(r * theta.cos(), r * theta.sin(), z);
            positions.push(Point3::from(dir));
            normals.push(dir);
        }
        PointCloud::from_mesh_vertices(positions, normals, None)
    }

    fn transformed(cloud: &PointCloud, xf: &Matrix4<f64>) -> PointCloud {
        let nxf = math::normal_transform(xf);
        PointCloud {
            positions: cloud
                .positions
                .iter()
                .map(|p| xf.transform_point(p))
                .collect(),
            normals: cloud.normals.iter().map(|n| (nxf * n).normalize()).collect(),
            boundary: cloud.boundary.clone(),
            point_cloud: cloud.point_cloud,
        }
    }

    fn seeded(seed: u64) -> IcpParams {
        IcpParams {
            seed: Some(seed),
            ..Default::default()
        }
    }

    fn rotation_block(xf: &Matrix4<f64>) -> Matrix3<f64> {
        xf.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Angle of the rotation `m`, assumed close to orthonormal.
    fn rotation_angle(m: &Matrix3<f64>) -> f64 {
        (((m.trace() - 1.0) / 2.0).clamp(-1.0, 1.0)).acos()
    }

    #[test]
    fn identity_alignment_stays_at_identity() {
        let cloud = sphere_cloud(500, 1);
        let diag = cloud.aabb().diagonal();

        let mut xf2 = Matrix4::identity();
        let err = icp(
            &cloud,
            &cloud,
            &Matrix4::identity(),
            &mut xf2,
            XformType::Rigid,
            seeded(11),
        )
        .unwrap();

        assert!(err <= 1e-4 * diag);
        assert_relative_eq!(xf2, Matrix4::identity(), epsilon = 1e-9);
    }

    #[test]
    fn recovers_a_small_translation() {
        // corner points of the unit cube with outward normals
        let center = Vector3::new(0.5, 0.5, 0.5);
        let mut positions = Vec::new();
        let mut normals = Vec::new();
        for &x in &[0.0, 1.0] {
            for &y in &[0.0, 1.0] {
                for &z in &[0.0, 1.0] {
                    let p = Point3::new(x, y, z);
                    positions.push(p);
                    normals.push((p.coords - center).normalize());
                }
            }
        }
        let set1 = PointCloud::from_mesh_vertices(positions, normals, None);
        let shift = Matrix4::new_translation(&Vector3::new(0.1, 0.0, 0.0));
        let set2 = transformed(&set1, &shift);

        let mut xf2 = Matrix4::identity();
        let err = icp(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            XformType::Rigid,
            seeded(2),
        )
        .unwrap();

        assert!(err <= 1e-4);
        assert_relative_eq!(
            xf2,
            Matrix4::new_translation(&Vector3::new(-0.1, 0.0, 0.0)),
            epsilon = 1e-6
        );
    }

    #[test]
    fn recovers_a_small_rotation() {
        let set1 = sphere_cloud(1000, 3);
        let rot = math::rotation(5f64.to_radians(), &Vector3::z());
        let set2 = transformed(&set1, &rot);

        let mut xf2 = Matrix4::identity();
        icp(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            XformType::Rigid,
            seeded(4),
        )
        .unwrap();

        // xf2 must undo the applied rotation
        let residual = rotation_block(&xf2) * rotation_block(&rot);
        assert!(rotation_angle(&residual) <= 0.05f64.to_radians());
    }

    #[test]
    fn similarity_recovers_a_uniform_scale() {
        let set1 = sphere_cloud(1000, 5);
        let warp = Matrix4::new_translation(&Vector3::new(0.05, -0.02, 0.04))
            * Matrix4::new_scaling(1.1);
        let set2 = transformed(&set1, &warp);

        let mut xf2 = Matrix4::identity();
        icp(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            XformType::Similarity,
            seeded(6),
        )
        .unwrap();

        // the recovered placement must shrink set2 by the applied factor
        let recovered = rotation_block(&xf2).determinant().powf(1.0 / 3.0).recip();
        assert!((recovered - 1.1).abs() <= 0.005 * 1.1);
    }

    #[test]
    fn noise_and_outliers_are_tolerated() {
        let set1 = sphere_cloud(1500, 7);
        let diag = set1.aabb().diagonal();
        let sigma = 0.01 * diag; // displacement norm
        let sigma_coord = sigma / 3f64.sqrt();

        let mut rng = StdRng::seed_from_u64(8);
        let mut gauss = || {
            let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            let u2: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
            (-2.0 * u1.ln()).sqrt() * u2.cos()
        };

        let mut set2 = transformed(&set1, &Matrix4::identity());
        for p in &mut set2.positions {
            *p += Vector3::new(gauss(), gauss(), gauss()) * sigma_coord;
        }
        // 5% outliers scattered across the bounding box
        let n_outliers = set2.len() / 20;
        for i in 0..n_outliers {
            let idx = i * 20;
            set2.positions[idx] = Point3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
        }

        let mut xf2 = Matrix4::identity();
        let err = icp(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            XformType::Rigid,
            seeded(9),
        )
        .unwrap();

        assert!(err <= 2.0 * sigma, "rms {err} vs sigma {sigma}");
        assert!(rotation_angle(&rotation_block(&xf2)) <= 2f64.to_radians());
        assert!(xf2.fixed_view::<3, 1>(0, 3).norm() <= 2.0 * sigma);
    }

    #[test]
    fn swapping_the_sets_inverts_the_transform() {
        let set1 = sphere_cloud(800, 10);
        let xf = math::rotation(4f64.to_radians(), &Vector3::new(0.2, 1.0, 0.1))
            * Matrix4::new_translation(&Vector3::new(0.1, -0.05, 0.07));
        let set2 = transformed(&set1, &xf);

        let mut forward = Matrix4::identity();
        icp(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut forward,
            XformType::Rigid,
            seeded(12),
        )
        .unwrap();

        let mut backward = Matrix4::identity();
        icp(
            &set2,
            &set1,
            &Matrix4::identity(),
            &mut backward,
            XformType::Rigid,
            seeded(13),
        )
        .unwrap();

        assert_relative_eq!(forward * backward, Matrix4::identity(), epsilon = 1e-4);
    }

    #[test]
    fn rigid_placement_stays_orthonormal() {
        let set1 = sphere_cloud(600, 14);
        let xf = math::rotation(3f64.to_radians(), &Vector3::x())
            * Matrix4::new_translation(&Vector3::new(0.02, 0.0, -0.03));
        let set2 = transformed(&set1, &xf);

        let mut xf2 = Matrix4::identity();
        icp(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            XformType::Rigid,
            seeded(15),
        )
        .unwrap();

        let r = rotation_block(&xf2);
        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-4);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn point_clouds_align_on_a_translation() {
        let set1 = sphere_cloud(600, 16);
        let shift = Matrix4::new_translation(&Vector3::new(0.15, 0.0, 0.0));
        let mut set1 = set1;
        set1.point_cloud = true;
        let mut set2 = transformed(&set1, &shift);
        set2.point_cloud = true;

        let mut xf2 = Matrix4::identity();
        icp(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            XformType::Translation,
            seeded(17),
        )
        .unwrap();

        // a translation-only run never touches the rotational block
        assert_relative_eq!(rotation_block(&xf2), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(
            xf2.fixed_view::<3, 1>(0, 3).into_owned(),
            Vector3::new(-0.15, 0.0, 0.0),
            epsilon = 1e-3
        );
    }

    #[test]
    fn distant_sets_fail_to_align() {
        let set1 = sphere_cloud(300, 18);
        let diag = set1.aabb().diagonal();
        let shift = Matrix4::new_translation(&Vector3::new(10.0 * diag, 0.0, 0.0));
        let set2 = transformed(&set1, &shift);

        let mut xf2 = Matrix4::identity();
        let result = icp(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            XformType::Rigid,
            seeded(19),
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_and_malformed_sets_are_rejected() {
        let empty = PointCloud::from_points(Vec::new(), Vec::new());
        let good = sphere_cloud(50, 20);

        let mut xf2 = Matrix4::identity();
        assert_eq!(
            icp(
                &empty,
                &good,
                &Matrix4::identity(),
                &mut xf2,
                XformType::Rigid,
                seeded(21),
            ),
            Err(IcpError::EmptyPointSet)
        );

        let no_normals = PointCloud {
            positions: good.positions.clone(),
            normals: Vec::new(),
            boundary: None,
            point_cloud: false,
        };
        assert_eq!(
            icp(
                &good,
                &no_normals,
                &Matrix4::identity(),
                &mut xf2,
                XformType::Rigid,
                seeded(22),
            ),
            Err(IcpError::MissingNormals)
        );
    }

    #[test]
    fn caller_supplied_weights_are_kept_synthesized_ones_cleared() {
        let set1 = sphere_cloud(200, 23);
        let set2 = transformed(
            &set1,
            &Matrix4::new_translation(&Vector3::new(0.05, 0.0, 0.0)),
        );

        // matching lengths: sticky, left intact
        let mut w1 = vec![1.0; set1.len()];
        let mut w2 = vec![1.0; set2.len()];
        let mut xf2 = Matrix4::identity();
        icp_weighted(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            &mut w1,
            &mut w2,
            0.0,
            XformType::Rigid,
            seeded(24),
        )
        .unwrap();
        assert_eq!(w1.len(), set1.len());
        assert_eq!(w2.len(), set2.len());

        // length mismatch: synthesized internally, cleared on return
        let mut w1 = vec![1.0; 3];
        let mut w2 = Vec::new();
        let mut xf2 = Matrix4::identity();
        icp_weighted(
            &set1,
            &set2,
            &Matrix4::identity(),
            &mut xf2,
            &mut w1,
            &mut w2,
            0.0,
            XformType::Rigid,
            seeded(25),
        )
        .unwrap();
        assert!(w1.is_empty());
        assert!(w2.is_empty());
    }
}
