//! The versioned calibration record and its snapshot store.
//!
//! `CalibrationData` is the single source of truth read by the reconstruction
//! pipeline. All mutation goes through [`CalibrationStore::commit`], which
//! replaces the whole record atomically; readers hold immutable snapshots and
//! never observe a partially-written record.

use std::sync::{Arc, RwLock};

use log::debug;
use nalgebra::UnitVector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::{CameraIntrinsics, Distortion, PinholeCamera};
use crate::math::{Mat3, Pt3, Real, Vec3};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("focal lengths must be positive: fx={fx}, fy={fy}")]
    NonPositiveFocal { fx: Real, fy: Real },
    #[error("laser plane normal must be unit length, |n| = {0}")]
    NonUnitNormal(Real),
    #[error("platform rotation is not a proper rotation (det = {0})")]
    ImproperRotation(Real),
}

/// Identifies one of the two laser emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaserId {
    Left,
    Right,
}

impl LaserId {
    pub const ALL: [LaserId; 2] = [LaserId::Left, LaserId::Right];

    pub fn index(&self) -> usize {
        match self {
            LaserId::Left => 0,
            LaserId::Right => 1,
        }
    }
}

impl std::fmt::Display for LaserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaserId::Left => write!(f, "left"),
            LaserId::Right => write!(f, "right"),
        }
    }
}

/// Camera intrinsics solve result, tied to the resolution it was computed at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntrinsicsEstimate {
    pub intrinsics: CameraIntrinsics,
    pub distortion: Distortion,
    /// (width, height) the estimate was computed at.
    pub resolution: (u32, u32),
    /// Root mean square reprojection error in pixels.
    pub rms_error: Real,
}

impl IntrinsicsEstimate {
    pub fn validate(&self) -> Result<(), DataError> {
        if self.intrinsics.fx <= 0.0 || self.intrinsics.fy <= 0.0 {
            return Err(DataError::NonPositiveFocal {
                fx: self.intrinsics.fx,
                fy: self.intrinsics.fy,
            });
        }
        Ok(())
    }

    pub fn camera(&self) -> PinholeCamera {
        PinholeCamera::new(self.intrinsics, self.distortion)
    }
}

/// A laser plane `n · p + d = 0` in the camera frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LaserPlane {
    /// Unit normal in the camera frame.
    pub normal: UnitVector3<Real>,
    /// Signed distance from the camera origin.
    pub distance: Real,
}

impl LaserPlane {
    pub fn new(normal: Vec3, distance: Real) -> Result<Self, DataError> {
        let norm = normal.norm();
        if (norm - 1.0).abs() > 1e-6 {
            return Err(DataError::NonUnitNormal(norm));
        }
        Ok(Self {
            normal: UnitVector3::new_normalize(normal),
            distance,
        })
    }

    /// Signed distance from a point to the plane.
    pub fn signed_distance(&self, p: &Pt3) -> Real {
        self.normal.dot(&p.coords) + self.distance
    }
}

/// Turntable axis pose relative to the camera.
///
/// The axis direction is the Z column of `rotation`; `translation` is a point
/// on the axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlatformExtrinsics {
    pub rotation: Mat3,
    pub translation: Vec3,
}

impl PlatformExtrinsics {
    pub fn new(rotation: Mat3, translation: Vec3) -> Result<Self, DataError> {
        let det = rotation.determinant();
        if (det - 1.0).abs() > 1e-6 {
            return Err(DataError::ImproperRotation(det));
        }
        Ok(Self {
            rotation,
            translation,
        })
    }

    /// Unit direction of the rotation axis in the camera frame.
    pub fn axis(&self) -> Vec3 {
        self.rotation.column(2).into_owned()
    }
}

/// The aggregated calibration record.
///
/// `Option` fields double as per-field validity flags: a field is valid
/// exactly when it is present. Created empty at process start; populated by
/// session commits or a profile load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationData {
    /// Monotonic commit counter, bumped by the store on every commit.
    pub version: u64,
    /// (width, height) the calibration applies to.
    pub resolution: Option<(u32, u32)>,
    pub intrinsics: Option<IntrinsicsEstimate>,
    /// Laser planes indexed by [`LaserId::index`].
    pub lasers: [Option<LaserPlane>; 2],
    pub platform: Option<PlatformExtrinsics>,
}

impl CalibrationData {
    pub fn laser(&self, id: LaserId) -> Option<&LaserPlane> {
        self.lasers[id.index()].as_ref()
    }

    /// True when every field required by the reconstruction pipeline is set.
    pub fn is_complete(&self) -> bool {
        self.resolution.is_some()
            && self.intrinsics.is_some()
            && self.lasers.iter().all(Option::is_some)
            && self.platform.is_some()
    }
}

/// Shared owner of the calibration record.
///
/// Commits clone the current record, apply the mutation, bump the version and
/// swap the whole `Arc` in one step. Snapshots taken before a commit keep the
/// record they were taken from.
#[derive(Debug)]
pub struct CalibrationStore {
    inner: RwLock<Arc<CalibrationData>>,
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(CalibrationData::default())),
        }
    }

    pub fn with_data(data: CalibrationData) -> Self {
        Self {
            inner: RwLock::new(Arc::new(data)),
        }
    }

    /// Current record snapshot.
    pub fn snapshot(&self) -> Arc<CalibrationData> {
        self.inner.read().expect("calibration store poisoned").clone()
    }

    /// Atomically replace the record with a mutated copy.
    pub fn commit(&self, mutate: impl FnOnce(&mut CalibrationData)) -> u64 {
        let mut guard = self.inner.write().expect("calibration store poisoned");
        let mut next = (**guard).clone();
        mutate(&mut next);
        next.version = guard.version + 1;
        let version = next.version;
        *guard = Arc::new(next);
        debug!("calibration record committed, version {version}");
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_intrinsics() -> IntrinsicsEstimate {
        IntrinsicsEstimate {
            intrinsics: CameraIntrinsics {
                fx: 800.0,
                fy: 800.0,
                cx: 320.0,
                cy: 240.0,
                skew: 0.0,
            },
            distortion: Distortion::default(),
            resolution: (640, 480),
            rms_error: 0.2,
        }
    }

    #[test]
    fn laser_plane_rejects_non_unit_normal() {
        assert!(LaserPlane::new(Vec3::new(0.0, 0.0, 2.0), 0.1).is_err());
        assert!(LaserPlane::new(Vec3::new(0.0, 0.0, 1.0), 0.1).is_ok());
    }

    #[test]
    fn platform_rejects_reflection() {
        let mut m = Mat3::identity();
        m[(0, 0)] = -1.0;
        assert!(PlatformExtrinsics::new(m, Vec3::zeros()).is_err());
        assert!(PlatformExtrinsics::new(Mat3::identity(), Vec3::zeros()).is_ok());
    }

    #[test]
    fn commit_bumps_version_and_keeps_old_snapshots() {
        let store = CalibrationStore::new();
        let before = store.snapshot();
        assert_eq!(before.version, 0);

        let v = store.commit(|d| {
            d.intrinsics = Some(some_intrinsics());
            d.resolution = Some((640, 480));
        });
        assert_eq!(v, 1);

        // The old snapshot is unchanged.
        assert!(before.intrinsics.is_none());
        let after = store.snapshot();
        assert!(after.intrinsics.is_some());
        assert_eq!(after.version, 1);
    }

    #[test]
    fn commit_touches_only_requested_fields() {
        let store = CalibrationStore::new();
        store.commit(|d| {
            d.lasers[LaserId::Left.index()] =
                Some(LaserPlane::new(Vec3::new(0.0, 0.0, 1.0), -0.3).unwrap());
        });
        store.commit(|d| d.intrinsics = Some(some_intrinsics()));

        let snap = store.snapshot();
        assert!(snap.laser(LaserId::Left).is_some());
        assert!(snap.laser(LaserId::Right).is_none());
        assert!(snap.intrinsics.is_some());
        assert!(snap.platform.is_none());
    }
}
