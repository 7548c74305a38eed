//! Laser plane fitting and stripe back-projection.
//!
//! Stripe pixels observed on the calibration target are back-projected to 3D
//! by intersecting camera rays with the target's `Z = 0` plane at a known
//! pose; points gathered across several poses are then fit with a plane via
//! covariance eigendecomposition.

use nalgebra::Point3;
use thiserror::Error;

use scancal_core::{Iso3, LaserPlane, PinholeCamera, Pt2, Pt3, Real, Vec3};

#[derive(Debug, Error)]
pub enum PlaneFitError {
    #[error("insufficient points for plane fit: got {got}, need at least {min}")]
    InsufficientPoints { got: usize, min: usize },
    #[error("degenerate point set: points are collinear or coincident")]
    Degenerate,
    #[error("ray parallel to target plane (degenerate geometry)")]
    RayParallelToTargetPlane,
}

/// Result of a least-squares plane fit.
#[derive(Debug, Clone, Copy)]
pub struct PlaneFit {
    pub plane: LaserPlane,
    /// Root mean square point-to-plane distance.
    pub rmse: Real,
}

/// Minimum point count accepted by [`fit_plane`].
pub const MIN_PLANE_POINTS: usize = 3;

// Relative eigenvalue floor below which the point spread is rank deficient.
const RANK_THRESHOLD: Real = 1e-8;

/// Fit a plane to 3D points in the camera frame.
///
/// The centroid and the smallest eigenvector of the centered covariance give
/// the plane; the ratio of the second-smallest to the largest eigenvalue
/// guards against collinear and coincident point sets.
pub fn fit_plane(points: &[Pt3]) -> Result<PlaneFit, PlaneFitError> {
    if points.len() < MIN_PLANE_POINTS {
        return Err(PlaneFitError::InsufficientPoints {
            got: points.len(),
            min: MIN_PLANE_POINTS,
        });
    }

    let n = points.len();
    let mut centroid = Vec3::zeros();
    for pt in points {
        centroid += pt.coords;
    }
    centroid /= n as Real;

    let mut cov = scancal_core::Mat3::zeros();
    for pt in points {
        let centered = pt.coords - centroid;
        cov += centered * centered.transpose();
    }

    let eigen = cov.symmetric_eigen();
    let mut indexed: Vec<(usize, Real)> = eigen.eigenvalues.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

    let (min_idx, _) = indexed[0];
    let (_, second) = indexed[1];
    let (_, largest) = indexed[2];

    // A plane needs rank 2 spread: two significant eigenvalues. Collinear
    // points have one, coincident points none.
    if largest <= RANK_THRESHOLD || second / largest < RANK_THRESHOLD {
        return Err(PlaneFitError::Degenerate);
    }

    let normal = eigen.eigenvectors.column(min_idx).into_owned();
    let normal = normal.normalize();
    let distance = -normal.dot(&centroid);

    let mut sum_sq = 0.0;
    for pt in points {
        let d = normal.dot(&pt.coords) + distance;
        sum_sq += d * d;
    }
    let rmse = (sum_sq / n as Real).sqrt();

    let plane = LaserPlane::new(normal, distance).map_err(|_| PlaneFitError::Degenerate)?;
    Ok(PlaneFit { plane, rmse })
}

/// Back-project stripe pixels onto the target plane at a known pose.
///
/// For each pixel: back-project to a camera ray, move the ray into the target
/// frame, intersect with `Z = 0`, and return the intersection in the camera
/// frame. `target_pose` is `T_C_T` from the pattern detection of the same
/// view.
pub fn intersect_target_plane(
    pixels: &[Pt2],
    camera: &PinholeCamera,
    target_pose: &Iso3,
) -> Result<Vec<Pt3>, PlaneFitError> {
    let mut points = Vec::with_capacity(pixels.len());

    for pixel in pixels {
        let ray_dir_camera = camera.backproject_pixel(&pixel.coords);

        let ray_origin_target = target_pose.inverse_transform_point(&Point3::origin());
        let ray_dir_target = target_pose.inverse_transform_vector(&ray_dir_camera);

        // Ray: p(t) = origin + t * dir; plane: Z = 0.
        if ray_dir_target.z.abs() < 1e-12 {
            return Err(PlaneFitError::RayParallelToTargetPlane);
        }
        let t = -ray_origin_target.z / ray_dir_target.z;
        let pt_target = ray_origin_target + ray_dir_target * t;

        points.push(target_pose.transform_point(&pt_target));
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};
    use scancal_core::{CameraIntrinsics, Distortion};

    #[test]
    fn plane_from_perfect_points() {
        // Ground truth plane z = 0.5: normal [0, 0, 1], distance -0.5.
        let points = vec![
            Pt3::new(0.0, 0.0, 0.5),
            Pt3::new(1.0, 0.0, 0.5),
            Pt3::new(0.0, 1.0, 0.5),
            Pt3::new(1.0, 1.0, 0.5),
            Pt3::new(0.5, 0.5, 0.5),
        ];

        let fit = fit_plane(&points).unwrap();
        assert!((fit.plane.normal.z.abs() - 1.0).abs() < 1e-6);
        assert!(fit.plane.normal.x.abs() < 1e-6);
        assert!((fit.plane.distance.abs() - 0.5).abs() < 1e-6);
        assert!(fit.rmse < 1e-10);
    }

    #[test]
    fn tilted_plane_normal_is_recovered() {
        // z = 0.5 x + 0.3  =>  normal ∝ [-0.5, 0, 1].
        let points = vec![
            Pt3::new(0.0, 0.0, 0.3),
            Pt3::new(1.0, 0.0, 0.8),
            Pt3::new(0.0, 1.0, 0.3),
            Pt3::new(1.0, 1.0, 0.8),
            Pt3::new(0.5, 0.5, 0.55),
        ];

        let fit = fit_plane(&points).unwrap();
        let expected = Vec3::new(-0.5, 0.0, 1.0).normalize();
        assert!(fit.plane.normal.dot(&expected).abs() > 0.99);
        assert!(fit.rmse < 1e-6);
    }

    #[test]
    fn too_few_points_fail() {
        let points = vec![Pt3::new(0.0, 0.0, 0.5), Pt3::new(1.0, 0.0, 0.5)];
        assert!(matches!(
            fit_plane(&points),
            Err(PlaneFitError::InsufficientPoints { got: 2, min: 3 })
        ));
    }

    #[test]
    fn collinear_points_are_degenerate() {
        let three = vec![
            Pt3::new(0.0, 0.0, 0.5),
            Pt3::new(1.0, 0.0, 0.5),
            Pt3::new(2.0, 0.0, 0.5),
        ];
        assert!(matches!(fit_plane(&three), Err(PlaneFitError::Degenerate)));

        let many: Vec<Pt3> = (0..5).map(|i| Pt3::new(i as Real, 0.0, 0.5)).collect();
        assert!(matches!(fit_plane(&many), Err(PlaneFitError::Degenerate)));
    }

    #[test]
    fn backprojection_lands_on_target_plane() {
        let camera = PinholeCamera::new(
            CameraIntrinsics {
                fx: 800.0,
                fy: 800.0,
                cx: 320.0,
                cy: 240.0,
                skew: 0.0,
            },
            Distortion::default(),
        );
        let pose = Iso3::from_parts(
            Translation3::new(0.0, 0.0, 400.0),
            UnitQuaternion::from_euler_angles(0.2, -0.1, 0.0),
        );

        // Project known target points and back-project their pixels.
        let targets = [Pt3::new(10.0, 20.0, 0.0), Pt3::new(-30.0, 5.0, 0.0)];
        let pixels: Vec<Pt2> = targets
            .iter()
            .map(|p| {
                let uv = camera.project_point(&pose.transform_point(p)).unwrap();
                Pt2::new(uv.x, uv.y)
            })
            .collect();

        let recovered = intersect_target_plane(&pixels, &camera, &pose).unwrap();
        for (r, t) in recovered.iter().zip(&targets) {
            let expected = pose.transform_point(t);
            assert!((r - expected).norm() < 1e-6, "{r:?} vs {expected:?}");
        }
    }
}
