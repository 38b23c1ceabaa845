//! The delta algebra every motion model provides.
//!
//! A delta is the motion accumulated since the origin key frame. Deltas form a
//! monoid under `delta_plus_delta` with `delta_zero` as identity, and
//! `delta_minus_delta` is its right inverse: `d1 ⊕ (d1 ⊖ d2) = d2`.
//! Covariances are expressed in the model's tangent space of size
//! `delta_cov_size`.

use nalgebra::{DMatrix, DVector};

use crate::constraints::ConstraintKind;
use crate::error::Result;
use crate::graph::FrameStructure;

pub trait MotionModel: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Layout of the states this model propagates.
    fn frame_structure(&self) -> FrameStructure;

    fn state_size(&self) -> usize {
        self.frame_structure().state_size()
    }

    fn data_size(&self) -> usize;

    fn delta_size(&self) -> usize;

    fn delta_cov_size(&self) -> usize;

    /// Convert one raw reading covering `dt` seconds into a delta and its covariance.
    fn data_to_delta(&self, data: &DVector<f64>, data_cov: &DMatrix<f64>, dt: f64) -> Result<(DVector<f64>, DMatrix<f64>)>;

    /// Covariance assumed for a reading that arrives without one.
    fn default_data_covariance(&self, data: &DVector<f64>, dt: f64) -> DMatrix<f64>;

    fn delta_plus_delta(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64>;

    /// Jacobians of `d1 ⊕ d2` with respect to `d1` and `d2`, in tangent space.
    fn delta_plus_delta_jacobians(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>);

    /// The delta `d` with `d1 ⊕ d = d2`.
    fn delta_minus_delta(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64>;

    /// Apply a delta to a state.
    fn x_plus_delta(&self, x: &DVector<f64>, d: &DVector<f64>) -> DVector<f64>;

    fn delta_zero(&self) -> DVector<f64>;

    /// Delta at fraction `alpha` of the way from `d1` to `d2`.
    fn interpolate(&self, d1: &DVector<f64>, d2: &DVector<f64>, alpha: f64) -> DVector<f64>;

    /// Constraint emitted when a delta is frozen between two key frames.
    fn constraint_kind(&self) -> ConstraintKind;

    /// Receive the sensor's intrinsic calibration (e.g. IMU biases).
    fn set_calibration(&mut self, _calibration: &DVector<f64>) {}
}

/// Propagate an integrated covariance through one composition step.
pub fn propagate_covariance(
    j1: &DMatrix<f64>,
    cov1: &DMatrix<f64>,
    j2: &DMatrix<f64>,
    cov2: &DMatrix<f64>,
) -> DMatrix<f64> {
    let p = j1 * cov1 * j1.transpose() + j2 * cov2 * j2.transpose();
    // keep exact symmetry against round-off
    (&p + p.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{ImuModel, Odom2dModel, Odom3dModel};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const TOL: f64 = 1e-9;

    fn random_delta(model: &dyn MotionModel, rng: &mut StdRng) -> DVector<f64> {
        let n = model.data_size();
        let data = DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0));
        let dt = rng.gen_range(0.01..0.5);
        let (d, _) = model
            .data_to_delta(&data, &DMatrix::identity(n, n), dt)
            .unwrap();
        d
    }

    fn check_laws(model: &dyn MotionModel, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let zero = model.delta_zero();
        for _ in 0..50 {
            let d1 = random_delta(model, &mut rng);
            let d2 = random_delta(model, &mut rng);

            assert_relative_eq!(model.delta_plus_delta(&zero, &d1), d1, epsilon = TOL);
            assert_relative_eq!(model.delta_plus_delta(&d1, &zero), d1, epsilon = TOL);

            let diff = model.delta_minus_delta(&d1, &d2);
            assert_relative_eq!(model.delta_plus_delta(&d1, &diff), d2, epsilon = TOL);

            let x = model.x_plus_delta(&model.frame_structure().zero_state(), &d1);
            assert_eq!(x.len(), model.state_size());
        }
    }

    #[test]
    fn test_odom_2d_delta_laws() {
        check_laws(&Odom2dModel::default(), 2);
    }

    #[test]
    fn test_odom_3d_delta_laws() {
        check_laws(&Odom3dModel::default(), 3);
    }

    #[test]
    fn test_imu_delta_laws() {
        check_laws(&ImuModel::default(), 9);
    }

    #[test]
    fn test_covariance_propagation_is_symmetric() {
        let j1 = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        let j2 = DMatrix::identity(2, 2);
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);

        let p = propagate_covariance(&j1, &cov, &j2, &cov);
        assert_relative_eq!(p[(0, 1)], p[(1, 0)], epsilon = 1e-15);
        assert!(p[(0, 0)] > cov[(0, 0)]);
    }
}
