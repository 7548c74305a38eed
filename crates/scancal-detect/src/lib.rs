//! Image-level feature extraction for the calibration engine.
//!
//! Two extractors operate on captured frames:
//! - [`detect_pattern`] finds the calibration target's feature grid and
//!   returns ordered 2D/3D correspondences,
//! - [`extract_stripe`] segments a laser stripe into per-row sub-pixel
//!   centroids.
//!
//! Both are pure functions of their inputs; a frame without the sought
//! feature is a recoverable condition, not a failure of the engine.

/// Feature-grid pattern detection.
pub mod grid;
/// Laser stripe segmentation.
pub mod stripe;

pub use grid::{detect_pattern, DetectError, GridDetectorConfig};
pub use stripe::{extract_stripe, StripeChannel, StripeConfig, StripeError, StripePoint};
