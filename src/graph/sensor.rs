//! Sensors: installed hardware and its calibration.

use super::types::{SensorId, StateBlockId};

/// Sensor family; selects which processors and constraints apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Odom2D,
    Odom3D,
    Imu,
    GpsFix,
    Camera,
}

impl SensorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SensorKind::Odom2D => "ODOM 2D",
            SensorKind::Odom3D => "ODOM 3D",
            SensorKind::Imu => "IMU",
            SensorKind::GpsFix => "GPS FIX",
            SensorKind::Camera => "CAMERA",
        }
    }

    /// Sizes of the extrinsic position and orientation blocks.
    pub fn extrinsic_sizes(&self) -> (usize, usize) {
        match self {
            SensorKind::Odom2D | SensorKind::GpsFix => (2, 1),
            SensorKind::Odom3D | SensorKind::Imu | SensorKind::Camera => (3, 4),
        }
    }
}

/// An installed sensor. Extrinsics and intrinsics are state blocks so they can
/// be calibrated online; they start fixed.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub id: SensorId,
    pub name: String,
    pub kind: SensorKind,
    pub(crate) extrinsic_p: StateBlockId,
    pub(crate) extrinsic_o: StateBlockId,
    pub(crate) intrinsic: Option<StateBlockId>,
}

impl Sensor {
    pub fn extrinsic_position(&self) -> StateBlockId {
        self.extrinsic_p
    }

    pub fn extrinsic_orientation(&self) -> StateBlockId {
        self.extrinsic_o
    }

    pub fn intrinsic(&self) -> Option<StateBlockId> {
        self.intrinsic
    }

    pub fn state_blocks(&self) -> Vec<StateBlockId> {
        let mut blocks = vec![self.extrinsic_p, self.extrinsic_o];
        blocks.extend(self.intrinsic);
        blocks
    }
}
