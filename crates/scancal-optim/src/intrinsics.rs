//! Joint intrinsics + distortion + pose refinement.
//!
//! The full intrinsics calibration: Zhang initialization from per-view
//! homographies, pose-variety degeneracy check, then a joint LM solve over
//! `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` and one 6-DoF pose per view,
//! minimizing pixel reprojection error.

use log::debug;
use nalgebra::{DVector, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use scancal_core::{
    rotation_angle_between, CameraIntrinsics, Distortion, IntrinsicsEstimate, Iso3, PinholeCamera,
    Pt2, Real, TargetView,
};
use scancal_linear::{dlt_homography, estimate_intrinsics, pose_from_homography};

use crate::lm::LmBackend;
use crate::problem::{NllsProblem, NllsSolverBackend, SolveOptions};

#[derive(Debug, Error)]
pub enum CalibrateError {
    #[error("insufficient data: got {got} views, need at least {min}")]
    InsufficientData { got: usize, min: usize },
    #[error("degenerate view geometry: {0}")]
    DegenerateGeometry(String),
    #[error("solve diverged: rms reprojection error {rms:.3} px exceeds {max:.3} px")]
    DivergedSolve { rms: Real, max: Real },
}

/// Options for [`calibrate_intrinsics`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntrinsicsConfig {
    /// Minimum number of accumulated views before a solve is attempted.
    /// Clamped to at least 3; 8 or more is recommended.
    pub min_views: usize,
    /// Largest acceptable RMS reprojection error, in pixels.
    pub max_rms_px: Real,
    /// Solver iteration cap.
    pub max_iterations: usize,
    /// Minimum pairwise rotation between observed poses; flatter sequences
    /// carry too little parallax to constrain the solution.
    pub min_pose_spread_rad: Real,
}

impl Default for IntrinsicsConfig {
    fn default() -> Self {
        Self {
            min_views: 8,
            max_rms_px: 1.0,
            max_iterations: 100,
            min_pose_spread_rad: 0.1,
        }
    }
}

const INTRINSICS_DIM: usize = 9;
const POSE_DIM: usize = 6;

struct ReprojectionProblem<'a> {
    views: &'a [TargetView],
    total_points: usize,
}

impl<'a> ReprojectionProblem<'a> {
    fn new(views: &'a [TargetView]) -> Self {
        let total_points = views.iter().map(TargetView::len).sum();
        Self {
            views,
            total_points,
        }
    }
}

fn decode_camera(x: &DVector<Real>) -> PinholeCamera {
    PinholeCamera::new(
        CameraIntrinsics {
            fx: x[0],
            fy: x[1],
            cx: x[2],
            cy: x[3],
            skew: 0.0,
        },
        Distortion {
            k1: x[4],
            k2: x[5],
            p1: x[6],
            p2: x[7],
            k3: x[8],
        },
    )
}

fn decode_pose(x: &DVector<Real>, view_idx: usize) -> Iso3 {
    let off = INTRINSICS_DIM + POSE_DIM * view_idx;
    let rot = UnitQuaternion::from_scaled_axis(Vector3::new(x[off], x[off + 1], x[off + 2]));
    let tra = Translation3::new(x[off + 3], x[off + 4], x[off + 5]);
    Iso3::from_parts(tra, rot)
}

fn encode_params(camera: &PinholeCamera, poses: &[Iso3]) -> DVector<Real> {
    let mut x = DVector::zeros(INTRINSICS_DIM + POSE_DIM * poses.len());
    x[0] = camera.intrinsics.fx;
    x[1] = camera.intrinsics.fy;
    x[2] = camera.intrinsics.cx;
    x[3] = camera.intrinsics.cy;
    x[4] = camera.distortion.k1;
    x[5] = camera.distortion.k2;
    x[6] = camera.distortion.p1;
    x[7] = camera.distortion.p2;
    x[8] = camera.distortion.k3;
    for (i, pose) in poses.iter().enumerate() {
        let off = INTRINSICS_DIM + POSE_DIM * i;
        let axis = pose.rotation.scaled_axis();
        x[off] = axis.x;
        x[off + 1] = axis.y;
        x[off + 2] = axis.z;
        x[off + 3] = pose.translation.vector.x;
        x[off + 4] = pose.translation.vector.y;
        x[off + 5] = pose.translation.vector.z;
    }
    x
}

impl NllsProblem for ReprojectionProblem<'_> {
    fn num_params(&self) -> usize {
        INTRINSICS_DIM + POSE_DIM * self.views.len()
    }

    fn num_residuals(&self) -> usize {
        2 * self.total_points
    }

    fn residuals(&self, x: &DVector<Real>) -> DVector<Real> {
        let camera = decode_camera(x);
        let mut r = DVector::zeros(self.num_residuals());
        let mut row = 0;

        for (view_idx, view) in self.views.iter().enumerate() {
            let pose = decode_pose(x, view_idx);
            for (p3, p2) in view.iter() {
                let p_cam = pose.transform_point(p3);
                match camera.project_point(&p_cam) {
                    Some(uv) => {
                        r[row] = uv.x - p2.x;
                        r[row + 1] = uv.y - p2.y;
                    }
                    None => {
                        // A point swung behind the camera: punish hard so the
                        // solver backs out of the region.
                        r[row] = 1e4;
                        r[row + 1] = 1e4;
                    }
                }
                row += 2;
            }
        }
        r
    }
}

/// Solve for intrinsics and distortion over accumulated target views.
///
/// Pure: the caller decides whether to commit the result. See
/// [`CalibrateError`] for the failure taxonomy; a failed solve is always
/// reported, never silently accepted.
pub fn calibrate_intrinsics(
    views: &[TargetView],
    resolution: (u32, u32),
    config: &IntrinsicsConfig,
) -> Result<IntrinsicsEstimate, CalibrateError> {
    let min = config.min_views.max(3);
    if views.len() < min {
        return Err(CalibrateError::InsufficientData {
            got: views.len(),
            min,
        });
    }

    // Closed-form initialization: homography per view, Zhang for K, then a
    // pose per view from the homography decomposition.
    let mut homographies = Vec::with_capacity(views.len());
    for view in views {
        let planar: Vec<Pt2> = view.points_3d.iter().map(|p| Pt2::new(p.x, p.y)).collect();
        let h = dlt_homography(&planar, &view.points_2d)
            .map_err(|e| CalibrateError::DegenerateGeometry(e.to_string()))?;
        homographies.push(h);
    }

    let k0 = estimate_intrinsics(&homographies)
        .map_err(|e| CalibrateError::DegenerateGeometry(e.to_string()))?;
    let kmtx = k0.k_matrix();

    let mut poses = Vec::with_capacity(views.len());
    for h in &homographies {
        let pose = pose_from_homography(&kmtx, h)
            .map_err(|e| CalibrateError::DegenerateGeometry(e.to_string()))?;
        poses.push(pose);
    }

    // Degeneracy gate: all poses near-identical orientation means no
    // parallax for the distortion/focal trade-off.
    let mut max_spread = 0.0_f64;
    for i in 0..poses.len() {
        for j in (i + 1)..poses.len() {
            let ri = poses[i].rotation.to_rotation_matrix();
            let rj = poses[j].rotation.to_rotation_matrix();
            max_spread = max_spread.max(rotation_angle_between(ri.matrix(), rj.matrix()));
        }
    }
    if max_spread < config.min_pose_spread_rad {
        return Err(CalibrateError::DegenerateGeometry(format!(
            "pose spread {max_spread:.3} rad below minimum {:.3} rad",
            config.min_pose_spread_rad
        )));
    }

    let init_camera = PinholeCamera::new(
        CameraIntrinsics { skew: 0.0, ..k0 },
        Distortion::default(),
    );
    let x0 = encode_params(&init_camera, &poses);

    let problem = ReprojectionProblem::new(views);
    let opts = SolveOptions {
        max_iters: config.max_iterations,
        ..SolveOptions::default()
    };
    let (x_opt, report) = LmBackend.solve(&problem, x0, &opts);
    debug!(
        "intrinsics solve: {} evaluations, cost {:.3e}, converged: {}",
        report.iterations, report.final_cost, report.converged
    );

    // RMS pixel error straight from the final residual vector.
    let r = problem.residuals(&x_opt);
    let rms = (r.norm_squared() / problem.total_points as Real).sqrt();

    if !report.converged || rms > config.max_rms_px {
        return Err(CalibrateError::DivergedSolve {
            rms,
            max: config.max_rms_px,
        });
    }

    let camera = decode_camera(&x_opt);
    let estimate = IntrinsicsEstimate {
        intrinsics: camera.intrinsics,
        distortion: camera.distortion,
        resolution,
        rms_error: rms,
    };
    estimate.validate().map_err(|_| CalibrateError::DivergedSolve {
        rms,
        max: config.max_rms_px,
    })?;
    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scancal_core::{PatternModel, Pt3};

    fn ground_truth_camera() -> PinholeCamera {
        PinholeCamera::new(
            CameraIntrinsics {
                fx: 820.0,
                fy: 800.0,
                cx: 320.0,
                cy: 240.0,
                skew: 0.0,
            },
            Distortion {
                k1: -0.08,
                k2: 0.012,
                p1: 0.0005,
                p2: -0.0008,
                k3: 0.0,
            },
        )
    }

    fn varied_poses(n: usize) -> Vec<Iso3> {
        (0..n)
            .map(|i| {
                let t = i as Real;
                Iso3::from_parts(
                    Translation3::new(-70.0 + 6.0 * t, -50.0 + 4.0 * t, 520.0 + 18.0 * t),
                    UnitQuaternion::from_euler_angles(
                        0.22 * (0.9 * t).sin(),
                        0.25 * (0.7 * t + 1.0).cos(),
                        0.1 * (0.5 * t).sin(),
                    ),
                )
            })
            .collect()
    }

    fn synthetic_views(camera: &PinholeCamera, poses: &[Iso3]) -> Vec<TargetView> {
        let pattern = PatternModel::new(6, 5, 30.0, 0.0).unwrap();
        let board: Vec<Pt3> = pattern.object_points();

        poses
            .iter()
            .map(|pose| {
                let pixels: Vec<Pt2> = board
                    .iter()
                    .map(|p| {
                        let uv = camera.project_point(&pose.transform_point(p)).unwrap();
                        Pt2::new(uv.x, uv.y)
                    })
                    .collect();
                TargetView::new(board.clone(), pixels).unwrap()
            })
            .collect()
    }

    #[test]
    fn recovers_ground_truth_camera() {
        let cam_gt = ground_truth_camera();
        let views = synthetic_views(&cam_gt, &varied_poses(8));

        let est = calibrate_intrinsics(&views, (640, 480), &IntrinsicsConfig::default()).unwrap();

        let rel = |a: Real, b: Real| (a - b).abs() / b.abs();
        assert!(rel(est.intrinsics.fx, 820.0) < 0.01, "fx: {}", est.intrinsics.fx);
        assert!(rel(est.intrinsics.fy, 800.0) < 0.01, "fy: {}", est.intrinsics.fy);
        assert!(rel(est.intrinsics.cx, 320.0) < 0.01, "cx: {}", est.intrinsics.cx);
        assert!(rel(est.intrinsics.cy, 240.0) < 0.01, "cy: {}", est.intrinsics.cy);
        assert!((est.distortion.k1 + 0.08).abs() < 0.01, "k1: {}", est.distortion.k1);
        assert!(est.rms_error < 0.1, "rms: {}", est.rms_error);
    }

    #[test]
    fn too_few_views_never_solve() {
        let cam_gt = ground_truth_camera();
        let views = synthetic_views(&cam_gt, &varied_poses(5));

        assert!(matches!(
            calibrate_intrinsics(&views, (640, 480), &IntrinsicsConfig::default()),
            Err(CalibrateError::InsufficientData { got: 5, min: 8 })
        ));
    }

    #[test]
    fn identical_poses_are_degenerate() {
        let cam_gt = ground_truth_camera();
        let pose = varied_poses(1)[0];
        let views = synthetic_views(&cam_gt, &vec![pose; 8]);

        assert!(matches!(
            calibrate_intrinsics(&views, (640, 480), &IntrinsicsConfig::default()),
            Err(CalibrateError::DegenerateGeometry(_))
        ));
    }
}
