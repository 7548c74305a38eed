//! Laser stripe segmentation.
//!
//! Isolates the laser line in a frame and reduces it to one sub-pixel
//! centroid per image row. The pipeline is: background subtraction (or a
//! single color channel when no laser-off frame is available), optional
//! grayscale morphological open to remove speckle, optional binarization
//! threshold, then per-row strongest-segment center-of-mass.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use scancal_core::Frame;

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("background frame resolution {bg:?} does not match frame {frame:?}")]
    ResolutionMismatch { frame: (u32, u32), bg: (u32, u32) },
}

/// Channel the stripe is read from when no background frame is supplied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StripeChannel {
    /// Red plane, the common case for red line lasers.
    #[default]
    Red,
    /// Luminance plane.
    Luma,
}

/// Stripe segmentation options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StripeConfig {
    pub channel: StripeChannel,
    /// Enable grayscale morphological open before segmentation.
    pub open_enabled: bool,
    /// Square structuring element side, in pixels (odd, >= 3).
    pub open_kernel: u32,
    /// Enable fixed binarization threshold.
    pub threshold_enabled: bool,
    /// Intensities at or below this value are zeroed when thresholding.
    pub threshold: f32,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            channel: StripeChannel::Red,
            open_enabled: false,
            open_kernel: 3,
            threshold_enabled: true,
            threshold: 30.0,
        }
    }
}

/// One detected stripe sample: sub-pixel column position on an image row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StripePoint {
    pub row: u32,
    pub column: f64,
}

/// Extract per-row stripe centroids from `frame`.
///
/// `background` is the laser-off frame captured at the same pose; when given,
/// the stripe plane is the clamped difference of the two. Rows without
/// illuminated pixels contribute no point; a completely dark frame yields an
/// empty vector, not an error. Rows whose winning segment hugs the image
/// border are dropped as clipped.
pub fn extract_stripe(
    frame: &Frame,
    background: Option<&Frame>,
    config: &StripeConfig,
) -> Result<Vec<StripePoint>, StripeError> {
    let (w, h) = (frame.width() as usize, frame.height() as usize);

    let mut plane = select_plane(frame, config.channel);
    if let Some(bg) = background {
        if bg.resolution() != frame.resolution() {
            return Err(StripeError::ResolutionMismatch {
                frame: frame.resolution(),
                bg: bg.resolution(),
            });
        }
        let bg_plane = select_plane(bg, config.channel);
        for (v, b) in plane.iter_mut().zip(bg_plane) {
            *v = (*v - b).max(0.0);
        }
    }

    if config.open_enabled && config.open_kernel >= 3 {
        let radius = (config.open_kernel / 2) as usize;
        morphological_open(&mut plane, w, h, radius);
    }

    if config.threshold_enabled {
        for v in plane.iter_mut() {
            if *v <= config.threshold {
                *v = 0.0;
            }
        }
    }

    let mut points = Vec::new();
    for y in 0..h {
        let row = &plane[y * w..(y + 1) * w];
        if let Some(column) = strongest_segment_centroid(row) {
            // Centroids at the border are ambiguous: the stripe is likely
            // clipped by the sensor edge.
            if column < 1.0 || column > (w - 2) as f64 {
                continue;
            }
            points.push(StripePoint {
                row: y as u32,
                column,
            });
        }
    }
    Ok(points)
}

fn select_plane(frame: &Frame, channel: StripeChannel) -> Vec<f32> {
    match channel {
        StripeChannel::Red => frame.channel(0),
        StripeChannel::Luma => frame.luma(),
    }
}

/// Center of mass of the strongest illuminated segment of one row.
///
/// Disjoint segments compete by peak intensity; only the winner contributes,
/// which suppresses secondary reflections of the stripe.
fn strongest_segment_centroid(row: &[f32]) -> Option<f64> {
    let mut best_peak = 0.0f32;
    let mut best: Option<(usize, usize)> = None;

    let mut start = None;
    for (x, &v) in row.iter().chain(std::iter::once(&0.0f32)).enumerate() {
        if v > 0.0 {
            if start.is_none() {
                start = Some(x);
            }
        } else if let Some(s) = start.take() {
            let peak = row[s..x].iter().cloned().fold(0.0f32, f32::max);
            if peak > best_peak {
                best_peak = peak;
                best = Some((s, x));
            }
        }
    }

    let (s, e) = best?;
    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for (x, &v) in row[s..e].iter().enumerate() {
        num += (s + x) as f64 * v as f64;
        den += v as f64;
    }
    (den > 0.0).then(|| num / den)
}

/// In-place grayscale open: erosion then dilation with a square element.
///
/// Both passes are separable (row min/max then column min/max).
fn morphological_open(plane: &mut [f32], w: usize, h: usize, radius: usize) {
    separable_filter(plane, w, h, radius, f32::min, f32::INFINITY);
    separable_filter(plane, w, h, radius, f32::max, f32::NEG_INFINITY);
}

fn separable_filter(
    plane: &mut [f32],
    w: usize,
    h: usize,
    radius: usize,
    op: fn(f32, f32) -> f32,
    identity: f32,
) {
    let mut scratch = vec![0.0f32; w.max(h)];

    // Horizontal pass.
    for y in 0..h {
        let row = &plane[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(radius);
            let hi = (x + radius + 1).min(w);
            scratch[x] = row[lo..hi].iter().cloned().fold(identity, op);
        }
        plane[y * w..(y + 1) * w].copy_from_slice(&scratch[..w]);
    }

    // Vertical pass.
    for x in 0..w {
        for y in 0..h {
            let lo = y.saturating_sub(radius);
            let hi = (y + radius + 1).min(h);
            let mut acc = identity;
            for row in lo..hi {
                acc = op(acc, plane[row * w + x]);
            }
            scratch[y] = acc;
        }
        for y in 0..h {
            plane[y * w + x] = scratch[y];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(w: u32, h: u32, f: impl FnMut(u32, u32) -> u8) -> Frame {
        Frame::from_fn(w, h, f)
    }

    #[test]
    fn dark_frame_yields_no_points() {
        let frame = gray(64, 48, |_, _| 0);
        let points = extract_stripe(&frame, None, &StripeConfig::default()).unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn vertical_stripe_is_centroided_per_row() {
        // Stripe around column 20 with a symmetric intensity profile.
        let frame = gray(64, 10, |x, _| match x {
            19 => 100,
            20 => 200,
            21 => 100,
            _ => 0,
        });
        let points = extract_stripe(&frame, None, &StripeConfig::default()).unwrap();
        assert_eq!(points.len(), 10);
        for p in &points {
            assert!((p.column - 20.0).abs() < 1e-9, "centroid off: {}", p.column);
        }
    }

    #[test]
    fn strongest_of_two_segments_wins() {
        // Weak reflection at x=10, true stripe at x=40.
        let frame = gray(64, 4, |x, _| match x {
            10 => 60,
            39..=41 => 180,
            _ => 0,
        });
        let points = extract_stripe(&frame, None, &StripeConfig::default()).unwrap();
        for p in &points {
            assert!((p.column - 40.0).abs() < 1e-9);
        }
    }

    #[test]
    fn background_subtraction_removes_static_content() {
        let background = gray(32, 8, |x, _| if x == 5 { 150 } else { 0 });
        let on = gray(32, 8, |x, _| match x {
            5 => 150,
            12 => 120,
            _ => 0,
        });
        let points = extract_stripe(&on, Some(&background), &StripeConfig::default()).unwrap();
        assert_eq!(points.len(), 8);
        for p in &points {
            assert!((p.column - 12.0).abs() < 1e-9);
        }
    }

    #[test]
    fn border_centroids_are_rejected() {
        let frame = gray(32, 6, |x, _| if x == 0 { 200 } else { 0 });
        let points = extract_stripe(&frame, None, &StripeConfig::default()).unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn open_filter_kills_speckle() {
        // Single-pixel speckle vs a 3-wide stripe; open with a 3x3 element
        // erases the speckle and keeps the stripe.
        let frame = gray(40, 9, |x, y| {
            if x == 30 && y == 4 {
                255
            } else if (14..=16).contains(&x) {
                160
            } else {
                0
            }
        });
        let config = StripeConfig {
            open_enabled: true,
            open_kernel: 3,
            ..StripeConfig::default()
        };
        let points = extract_stripe(&frame, None, &config).unwrap();
        assert!(!points.is_empty());
        for p in &points {
            assert!((p.column - 15.0).abs() < 0.01, "speckle survived: {}", p.column);
        }
    }

    #[test]
    fn mismatched_background_is_an_error() {
        let frame = gray(32, 8, |_, _| 0);
        let bg = gray(16, 8, |_, _| 0);
        assert!(extract_stripe(&frame, Some(&bg), &StripeConfig::default()).is_err());
    }
}
