//! State blocks: the unit of estimation.
//!
//! A state block is a small dense vector (position, orientation, velocity,
//! landmark coordinates, sensor calibration) owned by exactly one Frame,
//! Landmark or Sensor. Constraints refer to blocks by [`StateBlockId`]; the
//! solver reads and writes the values in place through [`StateBlockStore`].

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};

use crate::error::{EstimationError, Result};
use crate::geometry::quaternion;

use super::types::{FrameId, LandmarkId, SensorId, StateBlockId};

/// The entity a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateOwner {
    Frame(FrameId),
    Landmark(LandmarkId),
    Sensor(SensorId),
}

/// Manifold structure of a block whose ambient size exceeds its degrees of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalParameterization {
    /// Unit quaternion `[x, y, z, w]` perturbed by a rotation vector on the right.
    Quaternion,
}

impl LocalParameterization {
    pub fn global_size(&self) -> usize {
        match self {
            LocalParameterization::Quaternion => 4,
        }
    }

    pub fn local_size(&self) -> usize {
        match self {
            LocalParameterization::Quaternion => 3,
        }
    }

    /// `x ⊞ δ`.
    pub fn plus(&self, x: &[f64], delta: &[f64]) -> DVector<f64> {
        match self {
            LocalParameterization::Quaternion => {
                let dq = quaternion::from_rotvec(delta);
                let q = quaternion::normalize(&quaternion::mul(x, &dq));
                DVector::from_row_slice(&q)
            }
        }
    }

    /// ∂(x ⊞ δ)/∂δ at δ = 0, shape global × local.
    pub fn plus_jacobian(&self, x: &[f64]) -> DMatrix<f64> {
        match self {
            LocalParameterization::Quaternion => {
                let (qx, qy, qz, qw) = (x[0], x[1], x[2], x[3]);
                #[rustfmt::skip]
                let j = DMatrix::from_row_slice(4, 3, &[
                     qw, -qz,  qy,
                     qz,  qw, -qx,
                    -qy,  qx,  qw,
                    -qx, -qy, -qz,
                ]);
                j * 0.5
            }
        }
    }
}

/// A contiguous block of estimated values.
#[derive(Debug, Clone)]
pub struct StateBlock {
    pub id: StateBlockId,
    pub owner: StateOwner,
    values: DVector<f64>,
    fixed: bool,
    local_parameterization: Option<LocalParameterization>,
}

impl StateBlock {
    pub fn new(id: StateBlockId, owner: StateOwner, values: DVector<f64>, fixed: bool) -> Self {
        Self {
            id,
            owner,
            values,
            fixed,
            local_parameterization: None,
        }
    }

    /// A unit-quaternion block; the stored values are normalized.
    pub fn quaternion(id: StateBlockId, owner: StateOwner, values: DVector<f64>, fixed: bool) -> Result<Self> {
        if values.len() != 4 {
            return Err(EstimationError::dimension("quaternion block", 4, values.len()));
        }
        let norm = values.norm();
        if norm < f64::EPSILON {
            return Err(EstimationError::InvalidValue(format!("quaternion block {} has zero norm", id)));
        }
        Ok(Self {
            id,
            owner,
            values: values / norm,
            fixed,
            local_parameterization: Some(LocalParameterization::Quaternion),
        })
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// Degrees of freedom seen by the solver.
    pub fn local_size(&self) -> usize {
        self.local_parameterization
            .map(|p| p.local_size())
            .unwrap_or_else(|| self.size())
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// Overwrite the values, keeping the block size.
    pub fn set_values(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.values.len() {
            return Err(EstimationError::dimension(
                format!("state block {}", self.id),
                self.values.len(),
                values.len(),
            ));
        }
        self.values.copy_from_slice(values);
        if self.local_parameterization == Some(LocalParameterization::Quaternion) {
            let n = self.values.norm();
            if n > f64::EPSILON {
                self.values /= n;
            }
        }
        Ok(())
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    pub fn local_parameterization(&self) -> Option<LocalParameterization> {
        self.local_parameterization
    }
}

/// Arena of all state blocks of a problem.
#[derive(Debug, Default)]
pub struct StateBlockStore {
    blocks: HashMap<StateBlockId, StateBlock>,
}

impl StateBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: StateBlock) {
        self.blocks.insert(block.id, block);
    }

    pub fn remove(&mut self, id: StateBlockId) -> Option<StateBlock> {
        self.blocks.remove(&id)
    }

    pub fn get(&self, id: StateBlockId) -> Result<&StateBlock> {
        self.blocks
            .get(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("state block {}", id)))
    }

    pub fn get_mut(&mut self, id: StateBlockId) -> Result<&mut StateBlock> {
        self.blocks
            .get_mut(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("state block {}", id)))
    }

    pub fn contains(&self, id: StateBlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateBlock> {
        self.blocks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn owner() -> StateOwner {
        StateOwner::Frame(FrameId::next())
    }

    #[test]
    fn test_quaternion_block_is_normalized() {
        let b = StateBlock::quaternion(
            StateBlockId::next(),
            owner(),
            DVector::from_row_slice(&[0.0, 0.0, 0.0, 2.0]),
            false,
        )
        .unwrap();

        assert_relative_eq!(b.values()[3], 1.0);
        assert_eq!(b.local_size(), 3);
    }

    #[test]
    fn test_set_values_wrong_size() {
        let mut b = StateBlock::new(StateBlockId::next(), owner(), DVector::zeros(2), false);

        let err = b.set_values(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 2, found: 3, .. }));
    }

    #[test]
    fn test_quaternion_plus_jacobian_matches_finite_difference() {
        let p = LocalParameterization::Quaternion;
        let q = quaternion::from_rotvec(&[0.3, -0.5, 0.2]);
        let j = p.plus_jacobian(&q);

        let h = 1e-7;
        for k in 0..3 {
            let mut d = [0.0; 3];
            d[k] = h;
            let qp = p.plus(&q, &d);
            for r in 0..4 {
                assert_relative_eq!((qp[r] - q[r]) / h, j[(r, k)], epsilon = 1e-6);
            }
        }
    }
}
