//! Captures: one sensor reading at one timestamp.

use nalgebra::{DMatrix, DVector};

use crate::motion::MotionBuffer;

use super::feature::Keypoint;
use super::types::{CaptureId, SensorId};

/// Raw or pre-processed payload of a capture.
#[derive(Debug, Clone)]
pub enum CaptureData {
    /// Proprioceptive reading to be integrated (odometry increments, IMU sample).
    Motion {
        data: DVector<f64>,
        covariance: DMatrix<f64>,
    },
    /// Absolute position fix.
    Fix {
        position: DVector<f64>,
        covariance: DMatrix<f64>,
    },
    /// Keypoints already extracted from an image.
    Keypoints(Vec<Keypoint>),
    /// Capture that only carries derived information, e.g. a frozen motion buffer.
    Empty,
}

/// A sensor reading. It is attached to a Frame once a processor decides where it belongs.
#[derive(Debug, Clone)]
pub struct Capture {
    pub id: CaptureId,
    pub timestamp: f64,
    pub sensor: SensorId,
    pub data: CaptureData,
    /// Integrated motion buffer, present on captures handled by motion processors.
    pub buffer: Option<MotionBuffer>,
}

impl Capture {
    pub fn new(sensor: SensorId, timestamp: f64, data: CaptureData) -> Self {
        Self {
            id: CaptureId::next(),
            timestamp,
            sensor,
            data,
            buffer: None,
        }
    }
}
