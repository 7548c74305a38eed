//! Shared synthetic-rig helpers for the session integration tests.

use scancal_core::{Frame, PatternModel, PinholeCamera, Pt2};

pub const LIGHT: u8 = 120;
pub const DARK: u8 = 20;
pub const DISC_RADIUS: f64 = 5.0;

/// Project the pattern's reference grid with `camera` at `pose`.
pub fn project_pattern(
    camera: &PinholeCamera,
    pattern: &PatternModel,
    pose: &scancal_core::Iso3,
) -> Vec<Pt2> {
    pattern
        .object_points()
        .iter()
        .map(|p| {
            let uv = camera
                .project_point(&pose.transform_point(p))
                .expect("pattern point behind camera in test setup");
            Pt2::new(uv.x, uv.y)
        })
        .collect()
}

/// Render the calibration target as dark discs on a mid-gray background.
pub fn render_pattern_frame(
    camera: &PinholeCamera,
    pattern: &PatternModel,
    pose: &scancal_core::Iso3,
    width: u32,
    height: u32,
) -> Frame {
    let centers = project_pattern(camera, pattern, pose);
    Frame::from_fn(width, height, |x, y| {
        let inside = centers.iter().any(|c| {
            let dx = x as f64 - c.x;
            let dy = y as f64 - c.y;
            dx * dx + dy * dy <= DISC_RADIUS * DISC_RADIUS
        });
        if inside {
            DARK
        } else {
            LIGHT
        }
    })
}
