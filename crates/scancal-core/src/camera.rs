//! Pinhole camera model with Brown-Conrady distortion.
//!
//! Projection pipeline: `pixel = K ∘ distort ∘ normalize(point)`.
//! Back-projection undoes each stage and returns a unit ray direction.

use serde::{Deserialize, Serialize};

use crate::math::{Mat3, Pt3, Real, Vec2, Vec3};

/// Pinhole intrinsics mapping normalized image coordinates to pixels.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Focal length in pixels along X.
    pub fx: Real,
    /// Focal length in pixels along Y.
    pub fy: Real,
    /// Principal point X coordinate in pixels.
    pub cx: Real,
    /// Principal point Y coordinate in pixels.
    pub cy: Real,
    /// Skew term (zero for the supported cameras).
    pub skew: Real,
}

impl CameraIntrinsics {
    /// The 3x3 camera matrix K.
    pub fn k_matrix(&self) -> Mat3 {
        Mat3::new(
            self.fx, self.skew, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0,
        )
    }

    /// Map normalized coordinates to pixel coordinates.
    pub fn normalized_to_pixel(&self, n: &Vec2) -> Vec2 {
        Vec2::new(
            self.fx * n.x + self.skew * n.y + self.cx,
            self.fy * n.y + self.cy,
        )
    }

    /// Map pixel coordinates to normalized coordinates.
    pub fn pixel_to_normalized(&self, px: &Vec2) -> Vec2 {
        let ny = (px.y - self.cy) / self.fy;
        let nx = (px.x - self.cx - self.skew * ny) / self.fx;
        Vec2::new(nx, ny)
    }
}

/// Brown-Conrady distortion with three radial and two tangential terms.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: Real,
    pub k2: Real,
    pub p1: Real,
    pub p2: Real,
    pub k3: Real,
}

impl Distortion {
    /// Distortion coefficients in the conventional `[k1, k2, p1, p2, k3]` order.
    pub fn coefficients(&self) -> [Real; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    fn distort_impl(&self, x: Real, y: Real) -> (Real, Real) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

        (x * radial + x_tan, y * radial + y_tan)
    }

    /// Apply distortion to undistorted normalized coordinates.
    pub fn distort(&self, n_undist: &Vec2) -> Vec2 {
        let (xd, yd) = self.distort_impl(n_undist.x, n_undist.y);
        Vec2::new(xd, yd)
    }

    /// Invert the distortion by fixed-point iteration.
    pub fn undistort(&self, n_dist: &Vec2) -> Vec2 {
        let mut x = n_dist.x;
        let mut y = n_dist.y;
        for _ in 0..8 {
            let (xd, yd) = self.distort_impl(x, y);
            x -= xd - n_dist.x;
            y -= yd - n_dist.y;
        }
        Vec2::new(x, y)
    }
}

/// A calibrated pinhole camera: intrinsics plus distortion.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PinholeCamera {
    pub intrinsics: CameraIntrinsics,
    pub distortion: Distortion,
}

impl PinholeCamera {
    pub fn new(intrinsics: CameraIntrinsics, distortion: Distortion) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the optical center.
    pub fn project_point(&self, p_c: &Pt3) -> Option<Vec2> {
        if p_c.z <= 0.0 {
            return None;
        }
        let n_u = Vec2::new(p_c.x / p_c.z, p_c.y / p_c.z);
        let n_d = self.distortion.distort(&n_u);
        Some(self.intrinsics.normalized_to_pixel(&n_d))
    }

    /// Back-project a pixel to a unit ray direction in the camera frame.
    pub fn backproject_pixel(&self, px: &Vec2) -> Vec3 {
        let n_d = self.intrinsics.pixel_to_normalized(px);
        let n_u = self.distortion.undistort(&n_d);
        Vec3::new(n_u.x, n_u.y, 1.0).normalize()
    }
}
