//! Detector capability: keypoints and descriptors inside a region of interest.

use nalgebra::Vector2;

use crate::error::{EstimationError, Result};
use crate::graph::{CaptureData, Keypoint};

/// Axis-aligned pixel region, `[x, x + width) × [y, y + height)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Roi {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Square window of half-size `radius` around `center`.
    pub fn around(center: &Vector2<f64>, radius: f64) -> Self {
        Self::new(center.x - radius, center.y - radius, 2.0 * radius, 2.0 * radius)
    }

    pub fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= self.x && pixel.x < self.x + self.width && pixel.y >= self.y && pixel.y < self.y + self.height
    }

    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(self.x + 0.5 * self.width, self.y + 0.5 * self.height)
    }
}

/// Produces keypoints from raw capture data.
pub trait Detector {
    /// Keypoints found in `roi`, strongest first.
    fn detect(&mut self, data: &CaptureData, roi: &Roi) -> Result<Vec<Keypoint>>;
}

/// Detector over captures that already carry extracted keypoints.
///
/// Returns the keypoints inside the region in their original order.
#[derive(Debug, Clone, Default)]
pub struct PointListDetector;

impl Detector for PointListDetector {
    fn detect(&mut self, data: &CaptureData, roi: &Roi) -> Result<Vec<Keypoint>> {
        match data {
            CaptureData::Keypoints(kps) => Ok(kps.iter().filter(|k| roi.contains(&k.pixel)).cloned().collect()),
            _ => Err(EstimationError::InvalidTopology(
                "point list detector needs a keypoint capture".to_string(),
            )),
        }
    }
}
