//! Closed-form (linear) solvers used to initialize the calibration pipeline.
//!
//! Everything here is a direct algebraic solve: DLT homographies, Zhang's
//! intrinsics initialization, plane-induced pose decomposition, laser-plane
//! fitting and the turntable-axis fit. Nonlinear refinement lives in
//! `scancal-optim`.

/// DLT homography estimation.
pub mod homography;
/// Zhang's closed-form intrinsics initialization.
pub mod intrinsics_init;
/// Laser plane fitting and stripe back-projection.
pub mod plane;
/// Planar pose from a homography.
pub mod pose;
/// Turntable rotation-axis fit from a pose sequence.
pub mod turntable;

pub use homography::{dlt_homography, HomographyError};
pub use intrinsics_init::{estimate_intrinsics, IntrinsicsInitError};
pub use plane::{fit_plane, intersect_target_plane, PlaneFit, PlaneFitError};
pub use pose::{pose_from_homography, PoseError};
pub use turntable::{fit_rotation_axis, AxisFit, AxisFitConfig, AxisFitError};
