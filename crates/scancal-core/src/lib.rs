//! Core math, camera model, and calibration record types for `scancal`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`, `Pt3`, ...),
//! - the pinhole camera model with Brown-Conrady distortion,
//! - the physical calibration target description ([`PatternModel`]),
//! - captured-frame access ([`Frame`]),
//! - the versioned calibration record ([`CalibrationData`]) and its
//!   atomically-replaced store ([`CalibrationStore`]),
//! - flat key-value profile (de)serialization of the record.

/// Pinhole camera model with Brown-Conrady distortion.
pub mod camera;
/// Versioned calibration record and its snapshot store.
pub mod data;
/// Captured frame pixel access.
pub mod frame;
/// Linear algebra type aliases and helpers.
pub mod math;
/// Physical calibration target geometry.
pub mod pattern;
/// Flat key-value profile serialization.
pub mod profile;

pub use camera::{CameraIntrinsics, Distortion, PinholeCamera};
pub use data::{
    CalibrationData, CalibrationStore, DataError, IntrinsicsEstimate, LaserId, LaserPlane,
    PlatformExtrinsics,
};
pub use frame::{Frame, FrameError};
pub use math::*;
pub use pattern::{PatternError, PatternModel, TargetView};
pub use profile::{profile_from_data, profile_to_data, ProfileError};
