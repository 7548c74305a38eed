//! Nonlinear least-squares refinement for the calibration engine.
//!
//! A small problem abstraction ([`NllsProblem`]) feeds a dense
//! Levenberg-Marquardt backend; the joint intrinsics/distortion/pose
//! reprojection problem is built on top of it.

/// Joint intrinsics + distortion + pose refinement.
pub mod intrinsics;
/// Levenberg-Marquardt backend.
pub mod lm;
/// Problem abstraction and solve options.
pub mod problem;

pub use intrinsics::{calibrate_intrinsics, CalibrateError, IntrinsicsConfig};
pub use lm::LmBackend;
pub use problem::{numeric_jacobian, NllsProblem, NllsSolverBackend, SolveOptions, SolveReport};
