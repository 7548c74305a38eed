//! Feature-grid pattern detection.
//!
//! Finds the dark feature blobs of the calibration target in a frame,
//! computes intensity-weighted sub-pixel centroids, and orders them into a
//! row-major grid matching [`PatternModel::object_points`]. Absence, partial
//! occlusion and bad exposure all surface as [`DetectError::NotFound`]; the
//! caller simply retries on the next frame.

use log::debug;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use scancal_core::{Frame, PatternModel, Pt2, Real, TargetView};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectError {
    /// The pattern is absent, occluded, or the exposure defeats segmentation.
    /// Recoverable: skip the frame and retry on the next one.
    #[error("calibration pattern not found in frame")]
    NotFound,
}

/// Tuning knobs for the grid detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridDetectorConfig {
    /// Smallest blob pixel count accepted as a pattern feature.
    pub min_blob_area: usize,
    /// Largest blob pixel count accepted as a pattern feature.
    pub max_blob_area: usize,
    /// Minimum intensity span of the frame; flatter frames are rejected
    /// as under/over-exposed.
    pub min_contrast: f32,
}

impl Default for GridDetectorConfig {
    fn default() -> Self {
        Self {
            min_blob_area: 4,
            max_blob_area: 10_000,
            min_contrast: 20.0,
        }
    }
}

/// Detect the target's feature grid in `frame`.
///
/// Returns correspondences ordered row-major (top row first, left to right),
/// paired with [`PatternModel::object_points`]. Pure function of its inputs.
pub fn detect_pattern(
    frame: &Frame,
    pattern: &PatternModel,
    config: &GridDetectorConfig,
) -> Result<TargetView, DetectError> {
    let luma = frame.luma();
    let (w, h) = (frame.width() as usize, frame.height() as usize);

    let lo = luma.iter().cloned().fold(f32::INFINITY, f32::min);
    let hi = luma.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !(hi - lo).is_finite() || hi - lo < config.min_contrast {
        debug!("frame rejected: intensity span {:.1} too flat", hi - lo);
        return Err(DetectError::NotFound);
    }
    let tau = 0.5 * (lo + hi);

    let centroids = blob_centroids(&luma, w, h, tau, config);
    let expected = pattern.point_count();
    if centroids.len() != expected {
        debug!(
            "blob count {} does not match pattern {}x{}",
            centroids.len(),
            pattern.rows(),
            pattern.columns()
        );
        return Err(DetectError::NotFound);
    }

    let ordered = order_grid(&centroids, pattern.rows() as usize, pattern.columns() as usize)
        .ok_or(DetectError::NotFound)?;

    TargetView::new(pattern.object_points(), ordered).map_err(|_| DetectError::NotFound)
}

/// Sub-pixel centroids of dark blobs below `tau`, filtered by area and
/// excluding blobs that touch the frame border (likely clipped features).
fn blob_centroids(
    luma: &[f32],
    w: usize,
    h: usize,
    tau: f32,
    config: &GridDetectorConfig,
) -> Vec<Pt2> {
    let mut visited = vec![false; w * h];
    let mut centroids = Vec::new();
    let mut stack = Vec::new();

    for start in 0..w * h {
        if visited[start] || luma[start] >= tau {
            continue;
        }

        // Flood-fill one 8-connected component.
        let mut area = 0usize;
        let mut weight_sum = 0.0f64;
        let mut wx = 0.0f64;
        let mut wy = 0.0f64;
        let mut touches_border = false;

        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            area += 1;
            let weight = (tau - luma[idx]) as f64;
            weight_sum += weight;
            wx += weight * x as f64;
            wy += weight * y as f64;
            if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
                touches_border = true;
            }

            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as isize + dx;
                    let ny = y as isize + dy;
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let nidx = ny as usize * w + nx as usize;
                    if !visited[nidx] && luma[nidx] < tau {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                }
            }
        }

        if touches_border || area < config.min_blob_area || area > config.max_blob_area {
            continue;
        }
        if weight_sum > 0.0 {
            centroids.push(Pt2::new(wx / weight_sum, wy / weight_sum));
        }
    }

    centroids
}

/// Order `rows * columns` centroids into a row-major grid.
///
/// Principal axes of the centroid cloud give the candidate row/column
/// directions; the cloud is split into `rows` bands at the largest gaps of
/// the cross-row projection, then each band is sorted along the row
/// direction. Returns `None` when no consistent ordering exists.
fn order_grid(points: &[Pt2], rows: usize, columns: usize) -> Option<Vec<Pt2>> {
    debug_assert_eq!(points.len(), rows * columns);

    let mean = points
        .iter()
        .fold(Vector2::zeros(), |acc: Vector2<Real>, p| acc + p.coords)
        / points.len() as Real;

    let mut cov = Matrix2::<Real>::zeros();
    for p in points {
        let d = p.coords - mean;
        cov += d * d.transpose();
    }
    let eigen = cov.symmetric_eigen();
    let (major, minor) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        (eigen.eigenvectors.column(0), eigen.eigenvectors.column(1))
    } else {
        (eigen.eigenvectors.column(1), eigen.eigenvectors.column(0))
    };
    let major = major.into_owned();
    let minor = minor.into_owned();

    // The split direction is ambiguous between the two axes; accept the
    // assignment that yields exactly `columns` points per row. Square grids
    // have an isotropic covariance, so the image axes serve as a fallback.
    try_order(points, rows, columns, &major, &minor)
        .or_else(|| try_order(points, rows, columns, &minor, &major))
        .or_else(|| try_order(points, rows, columns, &Vector2::x(), &Vector2::y()))
}

fn try_order(
    points: &[Pt2],
    rows: usize,
    columns: usize,
    row_dir: &Vector2<Real>,
    col_dir: &Vector2<Real>,
) -> Option<Vec<Pt2>> {
    // Fix orientation: rows advance downward in the image, columns rightward.
    let mut v = *col_dir;
    if v.y < 0.0 {
        v = -v;
    }
    let mut u = *row_dir;
    if u.x < 0.0 {
        u = -u;
    }
    // Consistent winding: right-then-down must be a right-handed image frame.
    if u.x * v.y - u.y * v.x <= 0.0 {
        return None;
    }

    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        let pa = points[a].coords.dot(&v);
        let pb = points[b].coords.dot(&v);
        pa.partial_cmp(&pb).unwrap()
    });

    // Split into `rows` bands at the largest projection gaps.
    let proj: Vec<Real> = order.iter().map(|&i| points[i].coords.dot(&v)).collect();
    let mut gaps: Vec<(Real, usize)> = proj
        .windows(2)
        .enumerate()
        .map(|(i, pair)| (pair[1] - pair[0], i + 1))
        .collect();
    gaps.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    let mut cuts: Vec<usize> = gaps.iter().take(rows - 1).map(|&(_, pos)| pos).collect();
    cuts.sort_unstable();

    let mut bands = Vec::with_capacity(rows);
    let mut begin = 0;
    for &cut in cuts.iter().chain(std::iter::once(&points.len())) {
        bands.push(&order[begin..cut]);
        begin = cut;
    }
    if bands.len() != rows || bands.iter().any(|b| b.len() != columns) {
        return None;
    }

    let mut ordered = Vec::with_capacity(points.len());
    for band in bands {
        let mut row: Vec<usize> = band.to_vec();
        row.sort_by(|&a, &b| {
            let pa = points[a].coords.dot(&u);
            let pb = points[b].coords.dot(&u);
            pa.partial_cmp(&pb).unwrap()
        });
        ordered.extend(row.into_iter().map(|i| points[i]));
    }
    Some(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scancal_core::PatternModel;

    /// Render dark discs on a light background at the given centers.
    fn render(w: u32, h: u32, centers: &[(f64, f64)], radius: f64) -> Frame {
        Frame::from_fn(w, h, |x, y| {
            let inside = centers.iter().any(|&(cx, cy)| {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                dx * dx + dy * dy <= radius * radius
            });
            if inside {
                20
            } else {
                230
            }
        })
    }

    fn grid_centers(rows: u32, cols: u32, origin: (f64, f64), step: f64, angle: f64) -> Vec<(f64, f64)> {
        let (sin, cos) = angle.sin_cos();
        let mut centers = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let x = c as f64 * step;
                let y = r as f64 * step;
                centers.push((
                    origin.0 + x * cos - y * sin,
                    origin.1 + x * sin + y * cos,
                ));
            }
        }
        centers
    }

    #[test]
    fn detects_full_grid_in_row_major_order() {
        let pattern = PatternModel::new(3, 4, 10.0, 0.0).unwrap();
        let centers = grid_centers(3, 4, (60.0, 50.0), 40.0, 0.0);
        let frame = render(260, 200, &centers, 8.0);

        let view = detect_pattern(&frame, &pattern, &GridDetectorConfig::default()).unwrap();
        assert_eq!(view.len(), 12);

        for (detected, expected) in view.points_2d.iter().zip(&centers) {
            assert!((detected.x - expected.0).abs() < 0.5, "x off: {detected:?} vs {expected:?}");
            assert!((detected.y - expected.1).abs() < 0.5, "y off: {detected:?} vs {expected:?}");
        }
    }

    #[test]
    fn detects_rotated_grid() {
        let pattern = PatternModel::new(3, 4, 10.0, 0.0).unwrap();
        let centers = grid_centers(3, 4, (80.0, 50.0), 36.0, 0.12);
        let frame = render(280, 220, &centers, 7.0);

        let view = detect_pattern(&frame, &pattern, &GridDetectorConfig::default()).unwrap();
        assert_eq!(view.len(), 12);

        // Row-major: first point is the top-left feature, last the bottom-right.
        let first = view.points_2d.first().unwrap();
        let last = view.points_2d.last().unwrap();
        assert!((first.x - centers[0].0).abs() < 0.5);
        assert!((first.y - centers[0].1).abs() < 0.5);
        assert!((last.x - centers[11].0).abs() < 0.5);
        assert!((last.y - centers[11].1).abs() < 0.5);
    }

    #[test]
    fn occluded_grid_is_not_found() {
        let pattern = PatternModel::new(3, 4, 10.0, 0.0).unwrap();
        let mut centers = grid_centers(3, 4, (60.0, 50.0), 40.0, 0.0);
        centers.pop();
        let frame = render(260, 200, &centers, 8.0);

        assert_eq!(
            detect_pattern(&frame, &pattern, &GridDetectorConfig::default()),
            Err(DetectError::NotFound)
        );
    }

    #[test]
    fn flat_frame_is_not_found() {
        let pattern = PatternModel::new(3, 4, 10.0, 0.0).unwrap();
        let frame = Frame::from_fn(100, 80, |_, _| 128);
        assert_eq!(
            detect_pattern(&frame, &pattern, &GridDetectorConfig::default()),
            Err(DetectError::NotFound)
        );
    }
}
