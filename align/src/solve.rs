#![allow(non_snake_case)]

//! Incremental transform estimation from a pruned pair list: symmetric
//! point-to-plane least squares with Huber-style IRLS weights, a
//! translation-only variant, and post-hoc uniform-scale/affine refinement.

use common::math;
use nalgebra::{Matrix3, Matrix4, Matrix6, Point3, Vector3, Vector6};

use crate::matching::PtPair;

/// Eigendecomposition of the 6x6 normal-equation matrix, kept around for the
/// importance reweighter.
pub struct EigenSystem {
    pub evec: Matrix6<f64>,
    pub einv: Vector6<f64>,
}

pub struct SymmetricAlignment {
    pub xf: Matrix4<f64>,
    pub eig: EigenSystem,
}

/// World-space centroids of the two pair sides and the reciprocal of the RMS
/// pair distance to them, used to condition the normal equations.
pub fn centroids_and_scale(pairs: &[PtPair]) -> (Point3<f64>, Point3<f64>, f64) {
    let n = pairs.len() as f64;
    let mut c1 = Vector3::zeros();
    let mut c2 = Vector3::zeros();
    for pr in pairs {
        c1 += pr.p1.coords;
        c2 += pr.p2.coords;
    }
    c1 /= n;
    c2 /= n;

    let mut sum = 0.0;
    for pr in pairs {
        sum += (pr.p1.coords - c1).norm_squared() + (pr.p2.coords - c2).norm_squared();
    }
    let scale = if sum > 0.0 {
        (sum / (2.0 * n)).sqrt().recip()
    } else {
        1.0
    };
    (Point3::from(c1), Point3::from(c2), scale)
}

/// Accumulates the symmetric point-to-plane normal equations in the scaled,
/// centroid-relative frame. Each pair contributes its plane row weighted by
/// `regularization / max(|dn|, regularization)` (IRLS approximation of an L1
/// penalty on the plane residual) plus three point-to-point rows scaled down
/// by `regularization`.
fn accumulate(
    pairs: &[PtPair],
    scale: f64,
    c1: &Point3<f64>,
    c2: &Point3<f64>,
    regularization: f64,
) -> (Matrix6<f64>, Vector6<f64>) {
    let mut A = Matrix6::zeros();
    let mut b = Vector6::zeros();

    for pr in pairs {
        let p1 = (pr.p1 - c1) * scale;
        let p2 = (pr.p2 - c2) * scale;
        let n = 0.5 * (pr.n1 + pr.n2);
        let p = p1 + p2;
        let d = p1 - p2;
        let c = p.cross(&n);
        let dn = d.dot(&n);

        let w = regularization / dn.abs().max(regularization);

        let xn = Vector6::new(c.x, c.y, c.z, n.x, n.y, n.z);
        A += w * xn * xn.transpose();
        b += (w * dn) * xn;

        let wr = w * regularization;
        let xx = Vector6::new(0.0, p.z, -p.y, 1.0, 0.0, 0.0);
        let xy = Vector6::new(-p.z, 0.0, p.x, 0.0, 1.0, 0.0);
        let xz = Vector6::new(p.y, -p.x, 0.0, 0.0, 0.0, 1.0);
        A += wr * (xx * xx.transpose() + xy * xy.transpose() + xz * xz.transpose());
        b += wr * (d.x * xx + d.y * xy + d.z * xz);
    }

    (A, b)
}

/// Solves for the incremental rigid motion that moves `p2` towards `p1`. The
/// rotation is split symmetrically around the two centroids:
/// `T(c1) * R * T(t) * R * T(-c2)`.
pub fn align_symmetric(
    pairs: &[PtPair],
    scale: f64,
    c1: &Point3<f64>,
    c2: &Point3<f64>,
    regularization: f64,
) -> SymmetricAlignment {
    let (A, b) = accumulate(pairs, scale, c1, c2, regularization);

    let se = A.symmetric_eigen();
    let einv = math::invert_eigenvalues(&se.eigenvalues);
    let x = math::eig_solve6(&se.eigenvectors, &einv, &b);

    let rotvec = Vector3::new(x[0], x[1], x[2]);
    let rotangle = rotvec.norm().atan();
    let trans = Vector3::new(x[3], x[4], x[5]) * (rotangle.cos() / scale);

    let R = math::rotation(rotangle, &rotvec);
    let xf = Matrix4::new_translation(&c1.coords)
        * R
        * Matrix4::new_translation(&trans)
        * R
        * Matrix4::new_translation(&(-c2.coords));

    SymmetricAlignment {
        xf,
        eig: EigenSystem {
            evec: se.eigenvectors,
            einv,
        },
    }
}

/// Translation-only point-to-plane solve: a ridge-regularized 3x3 system on
/// the averaged normals.
pub fn align_translation(
    pairs: &[PtPair],
    scale: f64,
    c1: &Point3<f64>,
    c2: &Point3<f64>,
    regularization: f64,
) -> Matrix4<f64> {
    let mut A = Matrix3::zeros();
    let mut b = Vector3::zeros();

    for pr in pairs {
        let p1 = (pr.p1 - c1) * scale;
        let p2 = (pr.p2 - c2) * scale;
        let n = 0.5 * (pr.n1 + pr.n2);
        let d = p1 - p2;

        A += n * n.transpose();
        b += d.dot(&n) * n;
    }
    A += Matrix3::identity() * (regularization * pairs.len() as f64);

    let t = math::sym_solve3(&A, &b) / scale;
    Matrix4::new_translation(&(t + (c1.coords - c2.coords)))
}

/// Refines a rigid `alignxf` with a post-hoc scale component derived from the
/// pair covariances about the common centroid: a uniform scale, or a full
/// affine warp `cov1^(1/2) * cov2^(-1/2)`.
pub fn with_scale(
    pairs: &[PtPair],
    alignxf: Matrix4<f64>,
    c1: &Point3<f64>,
    c2: &Point3<f64>,
    affine: bool,
) -> Matrix4<f64> {
    let centroid = Point3::from(0.5 * (c1.coords + alignxf.transform_point(c2).coords));

    let mut cov1 = Matrix3::zeros();
    let mut cov2 = Matrix3::zeros();
    for pr in pairs {
        let d1 = pr.p1 - centroid;
        cov1 += d1 * d1.transpose();
        let d2 = alignxf.transform_point(&pr.p2) - centroid;
        cov2 += d2 * d2.transpose();
    }

    let warp = if affine {
        math::sym_pow(&cov1, 0.5) * math::sym_pow(&cov2, -0.5)
    } else {
        let ratio = if cov2.trace() > 0.0 {
            (cov1.trace() / cov2.trace()).sqrt()
        } else {
            1.0
        };
        Matrix3::identity() * ratio
    };

    Matrix4::new_translation(&centroid.coords)
        * warp.to_homogeneous()
        * Matrix4::new_translation(&(-centroid.coords))
        * alignxf
}

/// RMS distance between the reference points and the freshly aligned points.
pub fn rms_error(pairs: &[PtPair], alignxf: &Matrix4<f64>) -> f64 {
    let sum: f64 = pairs
        .iter()
        .map(|pr| (alignxf.transform_point(&pr.p2) - pr.p1).norm_squared())
        .sum();
    (sum / pairs.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    /// Random oriented points on the unit sphere with their true transformed
    /// counterparts: `true_xf * p2 == p1` exactly.
    fn exact_pairs(n: usize, true_xf: &Matrix4<f64>, seed: u64) -> Vec<PtPair> {
        let inv = true_xf.try_inverse().unwrap();
        let ninv = math::normal_transform(&inv);
        let mut rng = StdRng::seed_from_u64(seed);

        (0..n)
            .map(|_| {
                let z: f64 = rng.gen_range(-1.0..1.0);
                let theta: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
                let r = (1.0 - z * z).sqrt();
                let dir = Vector3::new(r * theta.cos(), r * theta.sin(), z);

                let p1 = Point3::from(dir);
                let n1 = dir;
                let p2 = inv.transform_point(&p1);
                let n2 = (ninv * n1).normalize();
                PtPair { p1, n1, p2, n2 }
            })
            .collect()
    }

    #[test]
    fn accumulated_system_is_symmetric() {
        let xf = math::rotation(0.05, &Vector3::new(0.3, 1.0, -0.2))
            * Matrix4::new_translation(&Vector3::new(0.02, -0.04, 0.01));
        let pairs = exact_pairs(100, &xf, 5);
        let (c1, c2, scale) = centroids_and_scale(&pairs);

        let (A, _) = accumulate(&pairs, scale, &c1, &c2, 1e-3);
        for j in 0..6 {
            for k in 0..6 {
                assert_relative_eq!(A[(j, k)], A[(k, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn recovers_small_rigid_motion() {
        let true_xf = math::rotation(2f64.to_radians(), &Vector3::new(1.0, 1.0, 0.0))
            * Matrix4::new_translation(&Vector3::new(0.05, -0.02, 0.03));
        let pairs = exact_pairs(500, &true_xf, 9);

        let (c1, c2, scale) = centroids_and_scale(&pairs);
        let alignment = align_symmetric(&pairs, scale, &c1, &c2, 1e-3);

        assert_relative_eq!(alignment.xf, true_xf, epsilon = 1e-4);
        assert!(rms_error(&pairs, &alignment.xf) < 1e-5);
    }

    #[test]
    fn recovers_pure_translation_exactly() {
        let true_xf = Matrix4::new_translation(&Vector3::new(0.1, -0.3, 0.02));
        let pairs = exact_pairs(200, &true_xf, 2);

        let (c1, c2, scale) = centroids_and_scale(&pairs);
        let xf = align_translation(&pairs, scale, &c1, &c2, 1e-3);

        assert_relative_eq!(xf, true_xf, epsilon = 1e-9);
    }

    /// Cube corners plus octahedron vertices: zero mean and an exactly
    /// isotropic covariance, so the post-hoc scale estimates are exact.
    fn isotropic_pairs(warp: impl Fn(&Point3<f64>) -> Point3<f64>) -> Vec<PtPair> {
        let mut points = Vec::new();
        for &x in &[-1.0, 1.0] {
            for &y in &[-1.0, 1.0] {
                for &z in &[-1.0, 1.0] {
                    points.push(Point3::new(x, y, z) / 3f64.sqrt());
                }
            }
        }
        for axis in 0..3 {
            for &sign in &[-1.0, 1.0] {
                let mut p = Point3::origin();
                p[axis] = sign;
                points.push(p);
            }
        }

        points
            .into_iter()
            .map(|p1| {
                let n = p1.coords.normalize();
                PtPair {
                    p1,
                    n1: n,
                    p2: warp(&p1),
                    n2: n,
                }
            })
            .collect()
    }

    #[test]
    fn post_hoc_uniform_scale_matches_covariances() {
        // p2 is a shrunken copy of p1; the rigid part is identity
        let pairs = isotropic_pairs(|p| Point3::from(p.coords / 1.2));

        let (c1, c2, _) = centroids_and_scale(&pairs);
        let xf = with_scale(&pairs, Matrix4::identity(), &c1, &c2, false);

        for pr in &pairs {
            assert_relative_eq!(xf.transform_point(&pr.p2), pr.p1, epsilon = 1e-9);
        }
    }

    #[test]
    fn post_hoc_affine_inverts_an_anisotropic_squash() {
        let squash = Matrix4::new_nonuniform_scaling(&Vector3::new(0.8, 1.0, 1.25));
        let pairs = isotropic_pairs(|p| squash.transform_point(p));

        let (c1, c2, _) = centroids_and_scale(&pairs);
        let xf = with_scale(&pairs, Matrix4::identity(), &c1, &c2, true);

        for pr in &pairs {
            assert_relative_eq!(xf.transform_point(&pr.p2), pr.p1, epsilon = 1e-9);
        }
    }
}
