//! Constraints: residual terms binding state blocks to a measurement.
//!
//! Each kind declares its residual size `M` and the ordered sizes of the
//! blocks it binds. A [`Constraint`] is only ever built after checking the
//! bound blocks and the measurement covariance against that signature, so a
//! mismatched constraint never reaches the solver.

pub mod cost;
pub mod fix_2d;
pub mod image_ahp;
pub mod imu;
pub mod odom_2d;
pub mod odom_3d;

use nalgebra::DVector;

use crate::error::{EstimationError, Result};
use crate::geometry::Scalar;
use crate::graph::{ConstraintId, Feature, FeatureId, StateBlockId};

pub use cost::{CostFunction, HuberLoss, JacobianMethod};
pub use image_ahp::CameraModel;

/// Constraint type with its per-type constants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintKind {
    Fix2D,
    Odom2D,
    Odom3D,
    Imu { gravity: [f64; 3] },
    ImageAhp(CameraModel),
}

impl ConstraintKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConstraintKind::Fix2D => "FIX 2D",
            ConstraintKind::Odom2D => "ODOM 2D",
            ConstraintKind::Odom3D => "ODOM 3D",
            ConstraintKind::Imu { .. } => "IMU",
            ConstraintKind::ImageAhp(_) => "IMAGE AHP",
        }
    }

    pub fn residual_size(&self) -> usize {
        match self {
            ConstraintKind::Fix2D => fix_2d::RESIDUAL_SIZE,
            ConstraintKind::Odom2D => odom_2d::RESIDUAL_SIZE,
            ConstraintKind::Odom3D => odom_3d::RESIDUAL_SIZE,
            ConstraintKind::Imu { .. } => imu::RESIDUAL_SIZE,
            ConstraintKind::ImageAhp(_) => image_ahp::RESIDUAL_SIZE,
        }
    }

    pub fn block_sizes(&self) -> &'static [usize] {
        match self {
            ConstraintKind::Fix2D => fix_2d::BLOCK_SIZES,
            ConstraintKind::Odom2D => odom_2d::BLOCK_SIZES,
            ConstraintKind::Odom3D => odom_3d::BLOCK_SIZES,
            ConstraintKind::Imu { .. } => imu::BLOCK_SIZES,
            ConstraintKind::ImageAhp(_) => image_ahp::BLOCK_SIZES,
        }
    }

    pub fn measurement_size(&self) -> usize {
        match self {
            ConstraintKind::Fix2D => fix_2d::MEASUREMENT_SIZE,
            ConstraintKind::Odom2D => odom_2d::MEASUREMENT_SIZE,
            ConstraintKind::Odom3D => odom_3d::MEASUREMENT_SIZE,
            ConstraintKind::Imu { .. } => imu::MEASUREMENT_SIZE,
            ConstraintKind::ImageAhp(_) => image_ahp::MEASUREMENT_SIZE,
        }
    }

    pub fn has_analytic_jacobian(&self) -> bool {
        matches!(self, ConstraintKind::Fix2D | ConstraintKind::Odom2D)
    }

    pub fn default_jacobian_method(&self) -> JacobianMethod {
        if self.has_analytic_jacobian() {
            JacobianMethod::Analytic
        } else {
            JacobianMethod::Auto
        }
    }

    /// Unwhitened error `e(x)`.
    pub fn error<T: Scalar>(&self, blocks: &[&[T]], meas: &[f64]) -> Vec<T> {
        match self {
            ConstraintKind::Fix2D => fix_2d::error(blocks, meas),
            ConstraintKind::Odom2D => odom_2d::error(blocks, meas),
            ConstraintKind::Odom3D => odom_3d::error(blocks, meas),
            ConstraintKind::Imu { gravity } => imu::error(blocks, meas, gravity),
            ConstraintKind::ImageAhp(cam) => image_ahp::error(blocks, meas, cam),
        }
    }
}

/// Whether a constraint takes part in optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintStatus {
    Active,
    Inactive,
}

/// A residual term owned by a Feature.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub id: ConstraintId,
    pub feature: FeatureId,
    pub status: ConstraintStatus,
    /// Wrap the residual in the solver's robust loss.
    pub apply_loss: bool,
    blocks: Vec<StateBlockId>,
    cost: CostFunction,
}

impl Constraint {
    /// Build a constraint on `feature` binding `blocks` (handle, size) in order.
    ///
    /// Fails with `DimensionMismatch` if the block count or any block size
    /// differs from the kind's signature, or if the feature's measurement or
    /// covariance does not have the expected size.
    pub fn new(kind: ConstraintKind, feature: &Feature, blocks: &[(StateBlockId, usize)]) -> Result<Self> {
        let name = kind.type_name();
        let expected = kind.block_sizes();
        if blocks.len() != expected.len() {
            return Err(EstimationError::dimension(
                format!("{} block count", name),
                expected.len(),
                blocks.len(),
            ));
        }
        for (i, ((_, size), want)) in blocks.iter().zip(expected.iter()).enumerate() {
            if size != want {
                return Err(EstimationError::dimension(format!("{} block {}", name, i), *want, *size));
            }
        }
        if feature.measurement().len() != kind.measurement_size() {
            return Err(EstimationError::dimension(
                format!("{} measurement", name),
                kind.measurement_size(),
                feature.measurement().len(),
            ));
        }
        if feature.covariance().nrows() != kind.residual_size() {
            return Err(EstimationError::dimension(
                format!("{} covariance", name),
                kind.residual_size(),
                feature.covariance().nrows(),
            ));
        }

        let method = kind.default_jacobian_method();
        Ok(Self {
            id: ConstraintId::next(),
            feature: feature.id,
            status: ConstraintStatus::Active,
            apply_loss: false,
            blocks: blocks.iter().map(|(id, _)| *id).collect(),
            cost: CostFunction::new(
                kind,
                feature.measurement().clone(),
                feature.sqrt_information().clone(),
                method,
            ),
        })
    }

    pub fn kind(&self) -> &ConstraintKind {
        self.cost.kind()
    }

    /// Bound state blocks, in signature order.
    pub fn blocks(&self) -> &[StateBlockId] {
        &self.blocks
    }

    pub fn cost(&self) -> &CostFunction {
        &self.cost
    }

    pub fn residual_size(&self) -> usize {
        self.cost.residual_size()
    }

    pub fn is_active(&self) -> bool {
        self.status == ConstraintStatus::Active
    }

    pub fn set_jacobian_method(&mut self, method: JacobianMethod) {
        self.cost.set_method(method);
    }

    /// Evaluate the whitened residual for the given block values.
    pub fn residual(&self, values: &[&[f64]]) -> DVector<f64> {
        self.cost.evaluate(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FeatureKind;
    use nalgebra::DMatrix;

    fn fix_feature() -> Feature {
        Feature::new(FeatureKind::Fix, DVector::from_row_slice(&[5.0, 0.0]), DMatrix::identity(2, 2)).unwrap()
    }

    #[test]
    fn test_wrong_block_size_is_rejected() {
        let f = fix_feature();
        let err = Constraint::new(ConstraintKind::Fix2D, &f, &[(StateBlockId::next(), 3)]).unwrap_err();

        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 2, found: 3, .. }));
    }

    #[test]
    fn test_wrong_block_count_is_rejected() {
        let f = fix_feature();
        let b = StateBlockId::next();
        let err = Constraint::new(ConstraintKind::Fix2D, &f, &[(b, 2), (b, 2)]).unwrap_err();

        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 1, found: 2, .. }));
    }

    #[test]
    fn test_covariance_size_must_match_residual() {
        let f = Feature::new(FeatureKind::Fix, DVector::zeros(2), DMatrix::identity(3, 3)).unwrap();
        let err = Constraint::new(ConstraintKind::Fix2D, &f, &[(StateBlockId::next(), 2)]).unwrap_err();

        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 2, found: 3, .. }));
    }

    #[test]
    fn test_fix_residual() {
        let f = fix_feature();
        let c = Constraint::new(ConstraintKind::Fix2D, &f, &[(StateBlockId::next(), 2)]).unwrap();

        let r = c.residual(&[&[6.0, 0.0]]);
        assert_eq!(r[0], -1.0);
        assert_eq!(c.kind().type_name(), "FIX 2D");
    }

    #[test]
    fn test_fix_residual_at_and_off_measurement() {
        let f = Feature::new(FeatureKind::Fix, DVector::from_row_slice(&[5.0, 5.0]), DMatrix::identity(2, 2)).unwrap();
        let c = Constraint::new(ConstraintKind::Fix2D, &f, &[(StateBlockId::next(), 2)]).unwrap();

        let r = c.residual(&[&[5.0, 5.0]]);
        assert_eq!((r[0], r[1]), (0.0, 0.0));

        let r = c.residual(&[&[6.0, 5.0]]);
        assert_eq!((r[0], r[1]), (-1.0, 0.0));
    }
}
