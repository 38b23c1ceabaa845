//! Planar odometry: data `(distance, dθ)`, delta and state `(x, y, θ)`.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

use crate::constraints::ConstraintKind;
use crate::error::{EstimationError, Result};
use crate::geometry::angle::pi2pi;
use crate::graph::FrameStructure;

use super::model::MotionModel;

/// Odometry noise growth, variance per unit of motion.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct Odom2dNoise {
    pub k_disp_to_disp: f64,
    pub k_rot_to_rot: f64,
}

impl Default for Odom2dNoise {
    fn default() -> Self {
        Self {
            k_disp_to_disp: 0.1,
            k_rot_to_rot: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Odom2dModel {
    pub noise: Odom2dNoise,
}

impl Odom2dModel {
    pub fn new(noise: Odom2dNoise) -> Self {
        Self { noise }
    }
}

fn compose(d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64> {
    let (c, s) = (d1[2].cos(), d1[2].sin());
    DVector::from_row_slice(&[
        d1[0] + c * d2[0] - s * d2[1],
        d1[1] + s * d2[0] + c * d2[1],
        pi2pi(d1[2] + d2[2]),
    ])
}

impl MotionModel for Odom2dModel {
    fn name(&self) -> &'static str {
        "ODOM 2D"
    }

    fn frame_structure(&self) -> FrameStructure {
        FrameStructure::Po2D
    }

    fn data_size(&self) -> usize {
        2
    }

    fn delta_size(&self) -> usize {
        3
    }

    fn delta_cov_size(&self) -> usize {
        3
    }

    fn data_to_delta(&self, data: &DVector<f64>, data_cov: &DMatrix<f64>, _dt: f64) -> Result<(DVector<f64>, DMatrix<f64>)> {
        if data.len() != 2 {
            return Err(EstimationError::dimension("odometry 2D data", 2, data.len()));
        }
        if data_cov.shape() != (2, 2) {
            return Err(EstimationError::dimension("odometry 2D data covariance", 2, data_cov.nrows()));
        }
        // Arc approximated by a chord at half the heading change.
        let (dist, dtheta) = (data[0], data[1]);
        let half = 0.5 * dtheta;
        let (c, s) = (half.cos(), half.sin());
        let delta = DVector::from_row_slice(&[dist * c, dist * s, dtheta]);

        #[rustfmt::skip]
        let j = DMatrix::from_row_slice(3, 2, &[
            c, -0.5 * dist * s,
            s,  0.5 * dist * c,
            0.0, 1.0,
        ]);
        Ok((delta, &j * data_cov * j.transpose()))
    }

    fn default_data_covariance(&self, data: &DVector<f64>, _dt: f64) -> DMatrix<f64> {
        let dist = data.get(0).copied().unwrap_or(0.0).abs();
        let rot = data.get(1).copied().unwrap_or(0.0).abs();
        DMatrix::from_diagonal(&DVector::from_row_slice(&[
            self.noise.k_disp_to_disp * dist,
            self.noise.k_rot_to_rot * rot,
        ]))
    }

    fn delta_plus_delta(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64> {
        compose(d1, d2)
    }

    fn delta_plus_delta_jacobians(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let (c, s) = (d1[2].cos(), d1[2].sin());
        #[rustfmt::skip]
        let j1 = DMatrix::from_row_slice(3, 3, &[
            1.0, 0.0, -s * d2[0] - c * d2[1],
            0.0, 1.0,  c * d2[0] - s * d2[1],
            0.0, 0.0, 1.0,
        ]);
        #[rustfmt::skip]
        let j2 = DMatrix::from_row_slice(3, 3, &[
            c, -s, 0.0,
            s,  c, 0.0,
            0.0, 0.0, 1.0,
        ]);
        (j1, j2)
    }

    fn delta_minus_delta(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64> {
        let (c, s) = (d1[2].cos(), d1[2].sin());
        let dx = d2[0] - d1[0];
        let dy = d2[1] - d1[1];
        DVector::from_row_slice(&[c * dx + s * dy, -s * dx + c * dy, pi2pi(d2[2] - d1[2])])
    }

    fn x_plus_delta(&self, x: &DVector<f64>, d: &DVector<f64>) -> DVector<f64> {
        compose(x, d)
    }

    fn delta_zero(&self) -> DVector<f64> {
        DVector::zeros(3)
    }

    fn interpolate(&self, d1: &DVector<f64>, d2: &DVector<f64>, alpha: f64) -> DVector<f64> {
        let step = self.delta_minus_delta(d1, d2) * alpha;
        compose(d1, &step)
    }

    fn constraint_kind(&self) -> ConstraintKind {
        ConstraintKind::Odom2D
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_straight_motion() {
        let m = Odom2dModel::default();
        let (d, cov) = m
            .data_to_delta(&DVector::from_row_slice(&[1.0, 0.0]), &(DMatrix::identity(2, 2) * 0.01), 0.1)
            .unwrap();

        assert_relative_eq!(d, DVector::from_row_slice(&[1.0, 0.0, 0.0]), epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 0)], 0.01, epsilon = 1e-12);
    }

    #[test]
    fn test_turn_then_advance() {
        let m = Odom2dModel::default();
        let turn = DVector::from_row_slice(&[0.0, 0.0, FRAC_PI_2]);
        let fwd = DVector::from_row_slice(&[1.0, 0.0, 0.0]);

        let d = m.delta_plus_delta(&turn, &fwd);
        assert_relative_eq!(d, DVector::from_row_slice(&[0.0, 1.0, FRAC_PI_2]), epsilon = 1e-12);
    }

    #[test]
    fn test_wrong_data_size() {
        let m = Odom2dModel::default();
        let err = m
            .data_to_delta(&DVector::zeros(3), &DMatrix::identity(2, 2), 0.1)
            .unwrap_err();
        assert!(matches!(err, EstimationError::DimensionMismatch { .. }));
    }
}
