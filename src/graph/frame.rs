//! Frames: robot states at a timestamp.

use nalgebra::DVector;

use crate::error::{EstimationError, Result};

use super::types::{FrameId, StateBlockId};

/// KEY frames enter optimization; NON_KEY frames are transient predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Key,
    NonKey,
}

/// Layout of a frame's state vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStructure {
    /// Planar pose: position (2) and heading (1).
    Po2D,
    /// Spatial pose: position (3) and unit quaternion (4).
    Po3D,
    /// Spatial pose with linear velocity (3).
    Pov3D,
}

impl FrameStructure {
    /// Sizes of the position, orientation and optional velocity blocks.
    pub fn block_sizes(&self) -> &'static [usize] {
        match self {
            FrameStructure::Po2D => &[2, 1],
            FrameStructure::Po3D => &[3, 4],
            FrameStructure::Pov3D => &[3, 4, 3],
        }
    }

    /// Total size of the concatenated state vector.
    pub fn state_size(&self) -> usize {
        self.block_sizes().iter().sum()
    }

    /// Identity state: zero position, identity rotation, zero velocity.
    pub fn zero_state(&self) -> DVector<f64> {
        match self {
            FrameStructure::Po2D => DVector::zeros(3),
            FrameStructure::Po3D => DVector::from_row_slice(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]),
            FrameStructure::Pov3D => DVector::from_row_slice(&[
                0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0,
            ]),
        }
    }

    pub fn is_3d(&self) -> bool {
        !matches!(self, FrameStructure::Po2D)
    }

    /// Check a state vector against this layout.
    pub fn check(&self, state: &DVector<f64>) -> Result<()> {
        if state.len() != self.state_size() {
            return Err(EstimationError::dimension(
                format!("{:?} frame state", self),
                self.state_size(),
                state.len(),
            ));
        }
        Ok(())
    }
}

/// A robot state at one timestamp.
///
/// The state values themselves live in the problem's state-block store; the
/// frame keeps handles to its blocks in layout order.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp: f64,
    pub kind: FrameKind,
    pub structure: FrameStructure,
    pub(crate) blocks: Vec<StateBlockId>,
}

impl Frame {
    pub fn is_key(&self) -> bool {
        self.kind == FrameKind::Key
    }

    pub fn position(&self) -> StateBlockId {
        self.blocks[0]
    }

    pub fn orientation(&self) -> StateBlockId {
        self.blocks[1]
    }

    pub fn velocity(&self) -> Option<StateBlockId> {
        self.blocks.get(2).copied()
    }

    /// State blocks in layout order.
    pub fn state_blocks(&self) -> &[StateBlockId] {
        &self.blocks
    }
}
