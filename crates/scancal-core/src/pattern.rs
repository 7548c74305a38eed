//! Physical calibration target geometry and per-view correspondences.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::{Pt2, Pt3, Real};

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern needs rows * columns >= 4, got {rows}x{columns}")]
    TooFewPoints { rows: u32, columns: u32 },
    #[error("square width must be positive, got {0}")]
    NonPositiveSquare(Real),
    #[error("3D / 2D point counts must match: {points_3d} vs {points_2d}")]
    MismatchedCounts { points_3d: usize, points_2d: usize },
}

/// Geometry of the planar calibration target.
///
/// The target is a `rows` x `columns` grid of features spaced `square_width_mm`
/// apart on the Z=0 plane of the target frame. `origin_distance_mm` is the
/// distance from the bottom feature row to the target's mounting edge; it
/// relates the target frame to the platform when the target rides the
/// turntable.
///
/// Immutable once a session starts; reconfigured only between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternModel {
    rows: u32,
    columns: u32,
    square_width_mm: Real,
    origin_distance_mm: Real,
}

impl PatternModel {
    pub fn new(
        rows: u32,
        columns: u32,
        square_width_mm: Real,
        origin_distance_mm: Real,
    ) -> Result<Self, PatternError> {
        if rows == 0 || columns == 0 || rows * columns < 4 {
            return Err(PatternError::TooFewPoints { rows, columns });
        }
        if square_width_mm <= 0.0 {
            return Err(PatternError::NonPositiveSquare(square_width_mm));
        }
        Ok(Self {
            rows,
            columns,
            square_width_mm,
            origin_distance_mm,
        })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn square_width_mm(&self) -> Real {
        self.square_width_mm
    }

    pub fn origin_distance_mm(&self) -> Real {
        self.origin_distance_mm
    }

    pub fn point_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    /// Reference grid on the Z=0 target plane, in millimetres.
    ///
    /// Row-major order: row 0 first, X fastest. Matches the ordering contract
    /// of the pattern detector.
    pub fn object_points(&self) -> Vec<Pt3> {
        let mut points = Vec::with_capacity(self.point_count());
        for r in 0..self.rows {
            for c in 0..self.columns {
                points.push(Pt3::new(
                    c as Real * self.square_width_mm,
                    r as Real * self.square_width_mm,
                    0.0,
                ));
            }
        }
        points
    }
}

/// Point correspondences detected in a single view of the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetView {
    /// 3D reference points in the target frame.
    pub points_3d: Vec<Pt3>,
    /// Detected pixel coordinates, same order as `points_3d`.
    pub points_2d: Vec<Pt2>,
}

impl TargetView {
    pub fn new(points_3d: Vec<Pt3>, points_2d: Vec<Pt2>) -> Result<Self, PatternError> {
        if points_3d.len() != points_2d.len() {
            return Err(PatternError::MismatchedCounts {
                points_3d: points_3d.len(),
                points_2d: points_2d.len(),
            });
        }
        Ok(Self {
            points_3d,
            points_2d,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points_3d.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points_3d.is_empty()
    }

    /// Iterate over (3D point, 2D point) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Pt3, &Pt2)> {
        self.points_3d.iter().zip(self.points_2d.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_grid() {
        assert!(PatternModel::new(1, 3, 10.0, 0.0).is_err());
        assert!(PatternModel::new(0, 5, 10.0, 0.0).is_err());
        assert!(PatternModel::new(2, 2, 0.0, 0.0).is_err());
        assert!(PatternModel::new(2, 2, 10.0, 0.0).is_ok());
    }

    #[test]
    fn object_points_are_row_major() {
        let pattern = PatternModel::new(2, 3, 10.0, 30.0).unwrap();
        let pts = pattern.object_points();
        assert_eq!(pts.len(), 6);
        assert_eq!(pts[0], Pt3::new(0.0, 0.0, 0.0));
        assert_eq!(pts[1], Pt3::new(10.0, 0.0, 0.0));
        assert_eq!(pts[3], Pt3::new(0.0, 10.0, 0.0));
    }
}
