//! The scanner driver seam and scoped source acquisition.
//!
//! The engine never talks to camera hardware directly: sessions consume a
//! [`Driver`] implementation provided by the host application. Acquisition is
//! scoped: [`SourceGuard`] applies the session's capture settings up front
//! and guarantees `release` on every exit path, including cancellation and
//! failed solves.

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use scancal_core::{Frame, LaserId};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver is not connected")]
    Disconnected,
    #[error("driver i/o failed: {0}")]
    Io(String),
}

/// Camera settings applied for the duration of one session.
///
/// Each calibration mode uses its own values: pattern work wants a bright,
/// contrasty image, laser work a dark one that isolates the stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub exposure: i32,
}

impl CaptureSettings {
    /// Bright settings for pattern detection work.
    pub fn pattern() -> Self {
        Self {
            brightness: 128,
            contrast: 32,
            saturation: 32,
            exposure: 16,
        }
    }

    /// Dark settings that isolate the laser stripe.
    pub fn laser() -> Self {
        Self {
            brightness: 0,
            contrast: 32,
            saturation: 64,
            exposure: 6,
        }
    }
}

/// Abstract scanner driver: camera plus the laser and turntable control the
/// scanner board exposes.
pub trait Driver {
    fn is_connected(&self) -> bool;

    fn capture_frame(&mut self) -> Result<Frame, DriverError>;

    fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), DriverError>;

    fn set_frame_rate(&mut self, fps: u32) -> Result<(), DriverError>;

    /// Apply brightness/contrast/saturation/exposure for the session.
    fn apply_settings(&mut self, settings: &CaptureSettings) -> Result<(), DriverError>;

    fn set_laser(&mut self, id: LaserId, on: bool) -> Result<(), DriverError>;

    /// Rotate the turntable by `angle_rad` (sign = direction).
    fn rotate_platform(&mut self, angle_rad: f64) -> Result<(), DriverError>;

    /// Undo session-scoped state: restore preview settings, switch lasers
    /// off. Called exactly once when the session releases the source.
    fn release(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Scoped acquisition of the frame source.
///
/// Applies the capture settings on construction and calls
/// [`Driver::release`] when dropped, whatever path the session exits on.
pub struct SourceGuard<'a, D: Driver + ?Sized> {
    driver: &'a mut D,
}

impl<'a, D: Driver + ?Sized> SourceGuard<'a, D> {
    pub fn acquire(driver: &'a mut D, settings: &CaptureSettings) -> Result<Self, DriverError> {
        if !driver.is_connected() {
            return Err(DriverError::Disconnected);
        }
        driver.apply_settings(settings)?;
        Ok(Self { driver })
    }
}

impl<D: Driver + ?Sized> std::ops::Deref for SourceGuard<'_, D> {
    type Target = D;
    fn deref(&self) -> &D {
        self.driver
    }
}

impl<D: Driver + ?Sized> std::ops::DerefMut for SourceGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.driver
    }
}

impl<D: Driver + ?Sized> Drop for SourceGuard<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.driver.release() {
            warn!("frame source release failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        applied: Option<CaptureSettings>,
        released: bool,
    }

    impl Driver for Probe {
        fn is_connected(&self) -> bool {
            true
        }
        fn capture_frame(&mut self) -> Result<Frame, DriverError> {
            Err(DriverError::Io("no frames".into()))
        }
        fn set_resolution(&mut self, _: u32, _: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn set_frame_rate(&mut self, _: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn apply_settings(&mut self, settings: &CaptureSettings) -> Result<(), DriverError> {
            self.applied = Some(*settings);
            Ok(())
        }
        fn set_laser(&mut self, _: LaserId, _: bool) -> Result<(), DriverError> {
            Ok(())
        }
        fn rotate_platform(&mut self, _: f64) -> Result<(), DriverError> {
            Ok(())
        }
        fn release(&mut self) -> Result<(), DriverError> {
            self.released = true;
            Ok(())
        }
    }

    #[test]
    fn guard_applies_settings_and_releases_on_drop() {
        let mut probe = Probe {
            applied: None,
            released: false,
        };
        {
            let _guard = SourceGuard::acquire(&mut probe, &CaptureSettings::laser()).unwrap();
        }
        assert_eq!(probe.applied, Some(CaptureSettings::laser()));
        assert!(probe.released);
    }
}
