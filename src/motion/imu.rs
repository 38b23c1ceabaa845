//! Inertial preintegration as a motion model.
//!
//! Data is one IMU reading `[ax, ay, az, ωx, ωy, ωz]`. The delta is the
//! preintegrated motion `[dp (3), dq (4), dv (3), dt (1)]` since the origin
//! key frame, expressed in the origin body frame and without gravity. Tangent
//! covariances use the order `[δp, δθ, δv]`. State is `[p, q, v]`.
//!
//! Composition (Forster et al.):
//!
//! ```text
//! dp = dp1 + dv1 dt2 + R1 dp2
//! dq = dq1 dq2
//! dv = dv1 + R1 dv2
//! dt = dt1 + dt2
//! ```

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::Deserialize;

use crate::constraints::ConstraintKind;
use crate::error::{EstimationError, Result};
use crate::geometry::{quaternion, so3};
use crate::graph::FrameStructure;

use super::model::MotionModel;

/// Gravity vector in world frame (m/s²).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// IMU noise densities (1-sigma, continuous time).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImuNoise {
    pub sigma_gyro: f64,
    pub sigma_accel: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            // EuRoC-like values
            sigma_gyro: 1.7e-4,
            sigma_accel: 2.0e-3,
        }
    }
}

/// Accelerometer and gyroscope biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            accel: Vector3::zeros(),
            gyro: Vector3::zeros(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImuModel {
    pub noise: ImuNoise,
    pub bias: ImuBias,
    pub gravity: Vector3<f64>,
}

impl Default for ImuModel {
    fn default() -> Self {
        Self::new(ImuNoise::default())
    }
}

struct ImuDelta {
    dp: Vector3<f64>,
    dq: [f64; 4],
    dv: Vector3<f64>,
    dt: f64,
}

impl ImuDelta {
    fn from_vector(d: &DVector<f64>) -> Self {
        Self {
            dp: Vector3::new(d[0], d[1], d[2]),
            dq: [d[3], d[4], d[5], d[6]],
            dv: Vector3::new(d[7], d[8], d[9]),
            dt: d[10],
        }
    }

    fn to_vector(&self) -> DVector<f64> {
        let q = quaternion::normalize(&self.dq);
        DVector::from_row_slice(&[
            self.dp.x, self.dp.y, self.dp.z, q[0], q[1], q[2], q[3], self.dv.x, self.dv.y, self.dv.z,
            self.dt,
        ])
    }

    fn rotation(&self) -> Matrix3<f64> {
        quaternion::to_unit(&self.dq).to_rotation_matrix().into_inner()
    }
}

fn rotate(q: &[f64; 4], v: &Vector3<f64>) -> Vector3<f64> {
    let r = quaternion::rotate(q, v.as_slice());
    Vector3::new(r[0], r[1], r[2])
}

impl ImuModel {
    pub fn new(noise: ImuNoise) -> Self {
        Self {
            noise,
            bias: ImuBias::zero(),
            gravity: GRAVITY,
        }
    }

    pub fn with_gravity(mut self, gravity: Vector3<f64>) -> Self {
        self.gravity = gravity;
        self
    }
}

impl MotionModel for ImuModel {
    fn name(&self) -> &'static str {
        "IMU"
    }

    fn frame_structure(&self) -> FrameStructure {
        FrameStructure::Pov3D
    }

    fn data_size(&self) -> usize {
        6
    }

    fn delta_size(&self) -> usize {
        11
    }

    fn delta_cov_size(&self) -> usize {
        9
    }

    fn data_to_delta(&self, data: &DVector<f64>, data_cov: &DMatrix<f64>, dt: f64) -> Result<(DVector<f64>, DMatrix<f64>)> {
        if data.len() != 6 {
            return Err(EstimationError::dimension("IMU data", 6, data.len()));
        }
        if data_cov.shape() != (6, 6) {
            return Err(EstimationError::dimension("IMU data covariance", 6, data_cov.nrows()));
        }
        let accel = Vector3::new(data[0], data[1], data[2]) - self.bias.accel;
        let omega = Vector3::new(data[3], data[4], data[5]) - self.bias.gyro;

        let phi = omega * dt;
        let delta = ImuDelta {
            dp: 0.5 * accel * dt * dt,
            dq: quaternion::from_rotvec(phi.as_slice()),
            dv: accel * dt,
            dt,
        };

        // Rows [δp, δθ, δv], columns [accel, gyro].
        let mut j = DMatrix::zeros(9, 6);
        j.view_mut((0, 0), (3, 3)).copy_from(&(Matrix3::identity() * (0.5 * dt * dt)));
        j.view_mut((3, 3), (3, 3)).copy_from(&(so3::right_jacobian(&phi) * dt));
        j.view_mut((6, 0), (3, 3)).copy_from(&(Matrix3::identity() * dt));
        Ok((delta.to_vector(), &j * data_cov * j.transpose()))
    }

    fn default_data_covariance(&self, _data: &DVector<f64>, dt: f64) -> DMatrix<f64> {
        // Continuous densities to per-sample variances.
        let scale = if dt > 0.0 { 1.0 / dt } else { 1.0 };
        let va = self.noise.sigma_accel * self.noise.sigma_accel * scale;
        let vg = self.noise.sigma_gyro * self.noise.sigma_gyro * scale;
        DMatrix::from_diagonal(&DVector::from_row_slice(&[va, va, va, vg, vg, vg]))
    }

    fn delta_plus_delta(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64> {
        let a = ImuDelta::from_vector(d1);
        let b = ImuDelta::from_vector(d2);
        ImuDelta {
            dp: a.dp + a.dv * b.dt + rotate(&a.dq, &b.dp),
            dq: quaternion::mul(&a.dq, &b.dq),
            dv: a.dv + rotate(&a.dq, &b.dv),
            dt: a.dt + b.dt,
        }
        .to_vector()
    }

    fn delta_plus_delta_jacobians(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let a = ImuDelta::from_vector(d1);
        let b = ImuDelta::from_vector(d2);
        let r1 = a.rotation();
        let r2 = b.rotation();

        let mut j1 = DMatrix::identity(9, 9);
        j1.view_mut((0, 3), (3, 3)).copy_from(&(-r1 * so3::skew(&b.dp)));
        j1.view_mut((0, 6), (3, 3)).copy_from(&(Matrix3::identity() * b.dt));
        j1.view_mut((3, 3), (3, 3)).copy_from(&r2.transpose());
        j1.view_mut((6, 3), (3, 3)).copy_from(&(-r1 * so3::skew(&b.dv)));

        let mut j2 = DMatrix::identity(9, 9);
        j2.view_mut((0, 0), (3, 3)).copy_from(&r1);
        j2.view_mut((6, 6), (3, 3)).copy_from(&r1);
        (j1, j2)
    }

    fn delta_minus_delta(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64> {
        let a = ImuDelta::from_vector(d1);
        let b = ImuDelta::from_vector(d2);
        let q1_inv = quaternion::conj(&a.dq);
        let dt = b.dt - a.dt;
        ImuDelta {
            dp: rotate(&q1_inv, &(b.dp - a.dp - a.dv * dt)),
            dq: quaternion::mul(&q1_inv, &b.dq),
            dv: rotate(&q1_inv, &(b.dv - a.dv)),
            dt,
        }
        .to_vector()
    }

    fn x_plus_delta(&self, x: &DVector<f64>, d: &DVector<f64>) -> DVector<f64> {
        let p = Vector3::new(x[0], x[1], x[2]);
        let q = [x[3], x[4], x[5], x[6]];
        let v = Vector3::new(x[7], x[8], x[9]);
        let d = ImuDelta::from_vector(d);
        let g = self.gravity;

        let p_new = p + v * d.dt + 0.5 * g * d.dt * d.dt + rotate(&q, &d.dp);
        let v_new = v + g * d.dt + rotate(&q, &d.dv);
        let q_new = quaternion::normalize(&quaternion::mul(&q, &d.dq));
        DVector::from_row_slice(&[
            p_new.x, p_new.y, p_new.z, q_new[0], q_new[1], q_new[2], q_new[3], v_new.x, v_new.y, v_new.z,
        ])
    }

    fn delta_zero(&self) -> DVector<f64> {
        ImuDelta {
            dp: Vector3::zeros(),
            dq: [0.0, 0.0, 0.0, 1.0],
            dv: Vector3::zeros(),
            dt: 0.0,
        }
        .to_vector()
    }

    fn interpolate(&self, d1: &DVector<f64>, d2: &DVector<f64>, alpha: f64) -> DVector<f64> {
        let step = ImuDelta::from_vector(&self.delta_minus_delta(d1, d2));
        let phi = quaternion::rotvec(&step.dq) * alpha;
        let scaled = ImuDelta {
            dp: step.dp * alpha,
            dq: quaternion::from_rotvec(phi.as_slice()),
            dv: step.dv * alpha,
            dt: step.dt * alpha,
        };
        self.delta_plus_delta(d1, &scaled.to_vector())
    }

    fn constraint_kind(&self) -> ConstraintKind {
        ConstraintKind::Imu {
            gravity: [self.gravity.x, self.gravity.y, self.gravity.z],
        }
    }

    /// Calibration layout `[ba (3), bg (3)]`.
    fn set_calibration(&mut self, calibration: &DVector<f64>) {
        if calibration.len() == 6 {
            self.bias = ImuBias {
                accel: Vector3::new(calibration[0], calibration[1], calibration[2]),
                gyro: Vector3::new(calibration[3], calibration[4], calibration[5]),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reading(accel: [f64; 3], gyro: [f64; 3]) -> DVector<f64> {
        DVector::from_row_slice(&[accel[0], accel[1], accel[2], gyro[0], gyro[1], gyro[2]])
    }

    #[test]
    fn test_constant_acceleration_integrates_exactly() {
        let m = ImuModel::default();
        let cov = DMatrix::identity(6, 6) * 1e-4;
        let mut d = m.delta_zero();
        for _ in 0..10 {
            let (step, _) = m.data_to_delta(&reading([1.0, 0.0, 0.0], [0.0; 3]), &cov, 0.1).unwrap();
            d = m.delta_plus_delta(&d, &step);
        }

        assert_relative_eq!(d[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(d[7], 1.0, epsilon = 1e-12);
        assert_relative_eq!(d[10], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gyro_bias_is_removed() {
        let mut m = ImuModel::default();
        m.set_calibration(&DVector::from_row_slice(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.2]));

        let (d, _) = m
            .data_to_delta(&reading([0.0; 3], [0.0, 0.0, 0.2]), &DMatrix::identity(6, 6), 0.5)
            .unwrap();
        assert_relative_eq!(d[6], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_stationary_state_falls_under_gravity() {
        let m = ImuModel::default();
        let x = FrameStructure::Pov3D.zero_state();
        let mut d = m.delta_zero();
        d[10] = 1.0;

        let x1 = m.x_plus_delta(&x, &d);
        assert_relative_eq!(x1[2], -0.5 * 9.81, epsilon = 1e-12);
        assert_relative_eq!(x1[9], -9.81, epsilon = 1e-12);
    }

    #[test]
    fn test_step_covariance_is_symmetric() {
        let m = ImuModel::default();
        let data = reading([0.1, 0.2, 9.8], [0.01, -0.02, 0.03]);
        let cov = m.default_data_covariance(&data, 0.005);

        let (_, step_cov) = m.data_to_delta(&data, &cov, 0.005).unwrap();
        assert_relative_eq!(step_cov.clone(), step_cov.transpose(), epsilon = 1e-18);
        for i in 0..9 {
            assert!(step_cov[(i, i)] > 0.0);
        }
    }
}
