//! Planar pose from a homography.
//!
//! Classic decomposition of a plane-induced homography `H = K [r1 r2 t]`
//! into a rotation and translation, assuming the target lies on its own
//! `Z = 0` plane.

use nalgebra::{Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use thiserror::Error;

use scancal_core::{Iso3, Mat3, Real};

#[derive(Debug, Error)]
pub enum PoseError {
    #[error("camera matrix is not invertible")]
    SingularCameraMatrix,
    #[error("svd failed")]
    SvdFailed,
}

/// Decompose homography `H` (plane -> image) into the target pose `T_C_T`
/// given intrinsics `K`.
pub fn pose_from_homography(kmtx: &Mat3, hmtx: &Mat3) -> Result<Iso3, PoseError> {
    let k_inv = kmtx.try_inverse().ok_or(PoseError::SingularCameraMatrix)?;

    let h1 = hmtx.column(0);
    let h2 = hmtx.column(1);
    let h3 = hmtx.column(2).into_owned();

    let k_inv_h1 = k_inv * h1;
    let k_inv_h2 = k_inv * h2;

    // Scale factor λ: normalize the first two columns (average for robustness).
    let norm1 = k_inv_h1.norm();
    let norm2 = k_inv_h2.norm();
    let lambda = 1.0 / ((norm1 + norm2) * 0.5);

    let r1 = (lambda * k_inv_h1).into_owned();
    let r2 = (lambda * k_inv_h2).into_owned();
    let r3 = r1.cross(&r2);

    let mut r_mat = Matrix3::<Real>::zeros();
    r_mat.set_column(0, &r1);
    r_mat.set_column(1, &r2);
    r_mat.set_column(2, &r3);

    // Project onto SO(3) (polar decomposition via SVD).
    let svd = r_mat.svd(true, true);
    let u = svd.u.ok_or(PoseError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(PoseError::SvdFailed)?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let t_vec: Vector3<Real> = lambda * (k_inv * h3);
    let rot = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    Ok(Iso3::from_parts(Translation3::from(t_vec), rot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scancal_core::CameraIntrinsics;

    #[test]
    fn recovers_synthetic_pose() {
        let kmtx = CameraIntrinsics {
            fx: 800.0,
            fy: 780.0,
            cx: 640.0,
            cy: 360.0,
            skew: 0.0,
        }
        .k_matrix();

        let rot = Rotation3::from_euler_angles(0.1, -0.05, 0.2);
        let t = Vector3::new(0.1, -0.05, 1.0);

        // For the Z=0 plane, H = K [r1 r2 t].
        let r_mat = rot.matrix();
        let mut hmtx = Mat3::zeros();
        hmtx.set_column(0, &(kmtx * r_mat.column(0)));
        hmtx.set_column(1, &(kmtx * r_mat.column(1)));
        hmtx.set_column(2, &(kmtx * t));

        let iso = pose_from_homography(&kmtx, &hmtx).unwrap();

        assert!((iso.translation.vector - t).norm() < 1e-3);
        let r_est = iso.rotation.to_rotation_matrix();
        let r_diff = r_est.matrix().transpose() * r_mat;
        let angle = ((r_diff.trace() - 1.0) * 0.5).clamp(-1.0, 1.0).acos();
        assert!(angle < 1e-3, "rotation error too large: {angle}");
    }

    #[test]
    fn singular_k_is_rejected() {
        let kmtx = Mat3::zeros();
        assert!(matches!(
            pose_from_homography(&kmtx, &Mat3::identity()),
            Err(PoseError::SingularCameraMatrix)
        ));
    }
}
