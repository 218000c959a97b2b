//! Small linear algebra helpers on top of nalgebra: homogeneous transform
//! constructors, normal transforms and symmetric eigen utilities used by the
//! alignment solver.

use nalgebra::{Matrix3, Matrix4, Matrix6, Vector3, Vector6};

/// Relative floor applied to eigenvalues before inverting or taking powers,
/// so rank-deficient systems stay finite.
const EIGENVALUE_FLOOR: f64 = 1e-12;

/// Homogeneous rotation by `angle` radians about `axis`. An (effectively)
/// zero axis yields the identity.
pub fn rotation(angle: f64, axis: &Vector3<f64>) -> Matrix4<f64> {
    let norm = axis.norm();
    if norm <= 0.0 {
        return Matrix4::identity();
    }
    Matrix4::new_rotation(axis * (angle / norm))
}

/// The transform to apply to normals when `xf` is applied to points: the
/// inverse transpose of the rotational 3x3 block. Falls back to the plain
/// block if it is singular.
pub fn normal_transform(xf: &Matrix4<f64>) -> Matrix3<f64> {
    let m = xf.fixed_view::<3, 3>(0, 0).into_owned();
    match m.try_inverse() {
        Some(inv) => inv.transpose(),
        None => m,
    }
}

/// Snaps the 3x3 block of `xf` back to a pure rotation (polar decomposition
/// via SVD), removing scale/shear drift accumulated by repeated composition.
/// The translation part is left untouched.
pub fn orthogonalize(xf: &mut Matrix4<f64>) {
    let m = xf.fixed_view::<3, 3>(0, 0).into_owned();
    let svd = m.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return;
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        // flip the weakest singular direction to stay in SO(3)
        u.column_mut(2).neg_mut();
        r = u * v_t;
    }
    xf.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    xf[(3, 0)] = 0.0;
    xf[(3, 1)] = 0.0;
    xf[(3, 2)] = 0.0;
    xf[(3, 3)] = 1.0;
}

/// Inverts eigenvalues with a relative floor. The floor keeps `sqrt(einv)`
/// finite when the system is rank deficient.
pub fn invert_eigenvalues(eigenvalues: &Vector6<f64>) -> Vector6<f64> {
    let floor = eigenvalues.max().max(f64::MIN_POSITIVE) * EIGENVALUE_FLOOR;
    eigenvalues.map(|l| 1.0 / l.max(floor))
}

/// Solves `A x = b` given the eigendecomposition of the symmetric matrix `A`:
/// rotates `b` into the eigenbasis, scales by the inverse eigenvalues and
/// rotates back.
pub fn eig_solve6(evec: &Matrix6<f64>, einv: &Vector6<f64>, b: &Vector6<f64>) -> Vector6<f64> {
    evec * einv.component_mul(&evec.tr_mul(b))
}

/// Solves the symmetric 3x3 system `A x = b` through its eigendecomposition,
/// with the same eigenvalue floor as the 6x6 path.
pub fn sym_solve3(a: &Matrix3<f64>, b: &Vector3<f64>) -> Vector3<f64> {
    let se = a.symmetric_eigen();
    let floor = se.eigenvalues.max().max(f64::MIN_POSITIVE) * EIGENVALUE_FLOOR;
    let einv = se.eigenvalues.map(|l| 1.0 / l.max(floor));
    se.eigenvectors * einv.component_mul(&se.eigenvectors.tr_mul(b))
}

/// `m^p` for a symmetric positive semi-definite matrix, by eigen
/// reconstruction `V diag(l^p) V^T`. Eigenvalues are clamped to a small
/// positive floor first, so negative powers of near-singular covariances do
/// not blow up.
pub fn sym_pow(m: &Matrix3<f64>, p: f64) -> Matrix3<f64> {
    let se = m.symmetric_eigen();
    let floor = se.eigenvalues.max().max(f64::MIN_POSITIVE) * EIGENVALUE_FLOOR;
    let d = se.eigenvalues.map(|l| l.max(floor).powf(p));
    se.eigenvectors * Matrix3::from_diagonal(&d) * se.eigenvectors.transpose()
}
