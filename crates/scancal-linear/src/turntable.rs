//! Turntable rotation-axis fit from a pose sequence.
//!
//! The calibration target rides the platform while it rotates through known
//! angular steps. Each relative motion between consecutive target poses is
//! the platform rotation conjugated into the camera frame, so all relative
//! rotations share the platform axis: the axis direction comes from the
//! angle-weighted rotation logs, and a point on the axis from the stacked
//! fixed-point system `(I - R_i) c = t_i`.

use log::debug;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use scancal_core::{Iso3, Mat3, PlatformExtrinsics, Real, Vec3};

#[derive(Debug, Error)]
pub enum AxisFitError {
    #[error("insufficient poses for axis fit: got {got}, need at least {min}")]
    InsufficientPoses { got: usize, min: usize },
    #[error("axis fit diverged: mean step-angle residual {residual:.4} rad exceeds {max:.4} rad")]
    DivergedSolve { residual: Real, max: Real },
    #[error("axis point solve failed: {0}")]
    SolveFailed(String),
}

/// Options for [`fit_rotation_axis`].
#[derive(Debug, Clone, Copy)]
pub struct AxisFitConfig {
    /// Known platform step between consecutive poses, in radians.
    pub step_angle_rad: Real,
    /// Largest tolerated mean deviation of the observed per-step rotation
    /// angle from `step_angle_rad`.
    pub max_angle_residual_rad: Real,
}

impl AxisFitConfig {
    pub fn new(step_angle_rad: Real) -> Self {
        Self {
            step_angle_rad,
            max_angle_residual_rad: 0.02,
        }
    }
}

/// Result of the axis fit.
#[derive(Debug, Clone, Copy)]
pub struct AxisFit {
    pub extrinsics: PlatformExtrinsics,
    /// Mean absolute deviation of per-step rotation angles from the
    /// configured step, in radians.
    pub mean_angle_residual: Real,
}

/// Minimum number of target poses (two relative motions).
pub const MIN_AXIS_POSES: usize = 3;

/// Fit the platform rotation axis to a sequence of target poses `T_C_T(i)`
/// captured at consecutive platform steps.
pub fn fit_rotation_axis(poses: &[Iso3], config: &AxisFitConfig) -> Result<AxisFit, AxisFitError> {
    if poses.len() < MIN_AXIS_POSES {
        return Err(AxisFitError::InsufficientPoses {
            got: poses.len(),
            min: MIN_AXIS_POSES,
        });
    }

    // Relative motions T_C_T(i+1) ∘ T_C_T(i)^-1 are conjugated platform steps.
    let motions: Vec<Iso3> = poses.windows(2).map(|w| w[1] * w[0].inverse()).collect();

    let mut axis_accum = Vec3::zeros();
    let mut residual_sum = 0.0;
    let mut reference: Option<Vec3> = None;

    for (i, motion) in motions.iter().enumerate() {
        let angle = motion.rotation.angle();
        residual_sum += (angle - config.step_angle_rad).abs();

        let Some(axis) = motion.rotation.axis() else {
            debug!("motion {i} carries no rotation, skipped for axis direction");
            continue;
        };
        let mut axis = axis.into_inner();

        // Quaternion logs return angles in [0, π]; align every axis with the
        // first usable one so opposite-sign steps do not cancel.
        match &reference {
            Some(r) => {
                if axis.dot(r) < 0.0 {
                    axis = -axis;
                }
            }
            None => reference = Some(axis),
        }
        axis_accum += axis * angle;
    }

    let mean_angle_residual = residual_sum / motions.len() as Real;
    if mean_angle_residual > config.max_angle_residual_rad {
        return Err(AxisFitError::DivergedSolve {
            residual: mean_angle_residual,
            max: config.max_angle_residual_rad,
        });
    }
    if axis_accum.norm() < 1e-12 {
        return Err(AxisFitError::SolveFailed("no usable rotation in pose sequence".into()));
    }
    let axis = axis_accum.normalize();

    let center = solve_axis_point(&motions)?;
    let rotation = basis_with_z(&axis);

    let extrinsics = PlatformExtrinsics::new(rotation, center)
        .map_err(|e| AxisFitError::SolveFailed(e.to_string()))?;
    Ok(AxisFit {
        extrinsics,
        mean_angle_residual,
    })
}

/// Least-squares point on the axis from `(I - R_i) c = t_i`.
///
/// The system is rank 2 (the axis direction is its null space); the SVD
/// solve yields the minimum-norm solution, i.e. the axis point closest to
/// the camera origin.
fn solve_axis_point(motions: &[Iso3]) -> Result<Vec3, AxisFitError> {
    let rows = 3 * motions.len();
    let mut a = DMatrix::<Real>::zeros(rows, 3);
    let mut b = DVector::<Real>::zeros(rows);

    for (i, motion) in motions.iter().enumerate() {
        let r = motion.rotation.to_rotation_matrix();
        let block = Mat3::identity() - r.matrix();
        for rr in 0..3 {
            for cc in 0..3 {
                a[(3 * i + rr, cc)] = block[(rr, cc)];
            }
            b[3 * i + rr] = motion.translation.vector[rr];
        }
    }

    let svd = a.svd(true, true);
    let c = svd
        .solve(&b, 1e-10)
        .map_err(|e| AxisFitError::SolveFailed(e.to_string()))?;
    Ok(Vec3::new(c[0], c[1], c[2]))
}

/// Right-handed orthonormal basis whose Z column is `axis`.
fn basis_with_z(axis: &Vec3) -> Mat3 {
    let seed = if axis.x.abs() < 0.9 {
        Vec3::x()
    } else {
        Vec3::y()
    };
    let x = (seed - axis * seed.dot(axis)).normalize();
    let y = axis.cross(&x);

    let mut m = Mat3::zeros();
    m.set_column(0, &x);
    m.set_column(1, &y);
    m.set_column(2, axis);
    m
}
