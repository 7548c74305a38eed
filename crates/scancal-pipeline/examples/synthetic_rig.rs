//! Run an intrinsics calibration session against a simulated rig.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example synthetic_rig
//! ```

use std::sync::Arc;

use nalgebra::{Translation3, UnitQuaternion};
use scancal_core::{
    CalibrationStore, CameraIntrinsics, Distortion, Frame, Iso3, LaserId, PatternModel,
    PinholeCamera, Pt2,
};
use scancal_pipeline::{
    save_profile, spawn_session, CaptureSettings, Driver, DriverError, SessionConfig,
    SessionEvent, SessionRegistry,
};

const WIDTH: u32 = 480;
const HEIGHT: u32 = 360;

/// Simulated camera looking at a pattern that steps through varied poses.
struct SyntheticRig {
    camera: PinholeCamera,
    pattern: PatternModel,
    shot: usize,
}

impl SyntheticRig {
    fn pose(&self, idx: usize) -> Iso3 {
        let t = idx as f64;
        Iso3::from_parts(
            Translation3::new(-55.0 + 3.0 * t, -70.0 + 2.5 * t, 620.0 + 15.0 * t),
            UnitQuaternion::from_euler_angles(
                0.16 * (0.9 * t).sin(),
                0.18 * (0.7 * t + 1.0).cos(),
                0.08 * (0.5 * t).sin(),
            ),
        )
    }

    fn render(&self, pose: &Iso3) -> Frame {
        let centers: Vec<Pt2> = self
            .pattern
            .object_points()
            .iter()
            .map(|p| {
                let uv = self
                    .camera
                    .project_point(&pose.transform_point(p))
                    .expect("pattern in front of camera");
                Pt2::new(uv.x, uv.y)
            })
            .collect();
        Frame::from_fn(WIDTH, HEIGHT, |x, y| {
            let inside = centers.iter().any(|c| {
                let dx = x as f64 - c.x;
                let dy = y as f64 - c.y;
                dx * dx + dy * dy <= 25.0
            });
            if inside {
                20
            } else {
                120
            }
        })
    }
}

impl Driver for SyntheticRig {
    fn is_connected(&self) -> bool {
        true
    }

    fn capture_frame(&mut self) -> Result<Frame, DriverError> {
        let pose = self.pose(self.shot);
        self.shot += 1;
        Ok(self.render(&pose))
    }

    fn set_resolution(&mut self, _: u32, _: u32) -> Result<(), DriverError> {
        Ok(())
    }
    fn set_frame_rate(&mut self, _: u32) -> Result<(), DriverError> {
        Ok(())
    }
    fn apply_settings(&mut self, _: &CaptureSettings) -> Result<(), DriverError> {
        Ok(())
    }
    fn set_laser(&mut self, _: LaserId, _: bool) -> Result<(), DriverError> {
        Ok(())
    }
    fn rotate_platform(&mut self, _: f64) -> Result<(), DriverError> {
        Ok(())
    }
}

fn main() {
    env_logger::init();

    let pattern = PatternModel::new(5, 4, 30.0, 30.0).expect("valid pattern");
    let rig = SyntheticRig {
        camera: PinholeCamera::new(
            CameraIntrinsics {
                fx: 600.0,
                fy: 590.0,
                cx: 240.0,
                cy: 180.0,
                skew: 0.0,
            },
            Distortion {
                k1: -0.03,
                k2: 0.004,
                p1: 0.0,
                p2: 0.0,
                k3: 0.0,
            },
        ),
        pattern,
        shot: 0,
    };

    let store = Arc::new(CalibrationStore::new());
    let registry = Arc::new(SessionRegistry::new());

    let handle = spawn_session(
        SessionConfig::intrinsics(pattern),
        Arc::clone(&store),
        registry,
        rig,
    );

    for event in handle.events.iter() {
        match event {
            SessionEvent::StateChanged(state) => println!("state: {state:?}"),
            SessionEvent::FrameAccepted { accepted, needed } => {
                println!("view {accepted}/{needed} accumulated")
            }
            SessionEvent::FrameSkipped { skipped } => println!("frame skipped ({skipped} so far)"),
        }
    }

    match handle.join() {
        Ok(report) => {
            println!(
                "committed version {:?} after {} views",
                report.committed_version, report.accepted
            );
            let snapshot = store.snapshot();
            let est = snapshot.intrinsics.expect("committed intrinsics");
            println!(
                "fx = {:.2}, fy = {:.2}, rms = {:.4} px",
                est.intrinsics.fx, est.intrinsics.fy, est.rms_error
            );
            println!(
                "profile: {}",
                serde_json::to_string_pretty(&save_profile(&store)).expect("profile serializes")
            );
        }
        Err(e) => eprintln!("calibration failed: {e}"),
    }
}
