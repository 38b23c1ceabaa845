//! Landmarks: static world entities observed from several frames.

use super::feature::Descriptor;
use super::types::{FrameId, LandmarkId, StateBlockId};

/// Landmark parameterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkKind {
    /// Planar point (2).
    Point2D,
    /// Euclidean point (3).
    Point3D,
    /// Anchored homogeneous point `(m, ρ)` (4): unit bearing `m` in the anchor
    /// camera and inverse distance `ρ`.
    Ahp { anchor: FrameId },
}

impl LandmarkKind {
    pub fn state_size(&self) -> usize {
        match self {
            LandmarkKind::Point2D => 2,
            LandmarkKind::Point3D => 3,
            LandmarkKind::Ahp { .. } => 4,
        }
    }

    /// Tag used by the factory registry and map files.
    pub fn type_name(&self) -> &'static str {
        match self {
            LandmarkKind::Point2D => "POINT 2D",
            LandmarkKind::Point3D => "POINT 3D",
            LandmarkKind::Ahp { .. } => "AHP",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Landmark {
    pub id: LandmarkId,
    pub kind: LandmarkKind,
    pub(crate) position: StateBlockId,
    pub descriptor: Option<Descriptor>,
}

impl Landmark {
    pub fn position(&self) -> StateBlockId {
        self.position
    }
}
