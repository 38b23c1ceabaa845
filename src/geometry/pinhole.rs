//! Pinhole camera intrinsics.

use nalgebra::{Vector2, Vector3};

use crate::error::{EstimationError, Result};

/// Pinhole intrinsics `(u0, v0, αu, αv)` without skew or distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeIntrinsics {
    pub u0: f64,
    pub v0: f64,
    pub alpha_u: f64,
    pub alpha_v: f64,
}

impl PinholeIntrinsics {
    pub fn new(u0: f64, v0: f64, alpha_u: f64, alpha_v: f64) -> Self {
        Self {
            u0,
            v0,
            alpha_u,
            alpha_v,
        }
    }

    /// Read from intrinsic state-block storage `[u0, v0, αu, αv]`.
    pub fn from_slice(k: &[f64]) -> Result<Self> {
        if k.len() != 4 {
            return Err(EstimationError::dimension("pinhole intrinsics", 4, k.len()));
        }
        Ok(Self::new(k[0], k[1], k[2], k[3]))
    }

    /// Project a point in the camera frame; `None` behind the camera.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= f64::EPSILON {
            return None;
        }
        Some(Vector2::new(
            self.u0 + self.alpha_u * p.x / p.z,
            self.v0 + self.alpha_v * p.y / p.z,
        ))
    }

    /// Unit-norm viewing direction of a pixel: normalize(K⁻¹ [u, v, 1]).
    pub fn bearing(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.u0) / self.alpha_u,
            (pixel.y - self.v0) / self.alpha_v,
            1.0,
        )
        .normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bearing_reprojects_to_pixel() {
        let k = PinholeIntrinsics::new(320.0, 240.0, 500.0, 510.0);
        let pixel = Vector2::new(100.0, 400.0);

        let p = k.bearing(&pixel) * 3.7;
        assert_relative_eq!(k.project(&p).unwrap(), pixel, epsilon = 1e-9);
    }

    #[test]
    fn test_project_behind_camera() {
        let k = PinholeIntrinsics::new(0.0, 0.0, 1.0, 1.0);
        assert!(k.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_from_slice_wrong_size() {
        assert!(PinholeIntrinsics::from_slice(&[1.0, 2.0, 3.0]).is_err());
    }
}
