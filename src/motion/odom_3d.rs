//! Spatial odometry: data `(dp, dφ)` with `dφ` a rotation vector; delta
//! `(dp, dq)` with a unit quaternion; state `(p, q)`.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::Deserialize;

use crate::constraints::ConstraintKind;
use crate::error::{EstimationError, Result};
use crate::geometry::{quaternion, so3};
use crate::graph::FrameStructure;

use super::model::MotionModel;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct Odom3dNoise {
    pub k_disp_to_disp: f64,
    pub k_rot_to_rot: f64,
}

impl Default for Odom3dNoise {
    fn default() -> Self {
        Self {
            k_disp_to_disp: 0.1,
            k_rot_to_rot: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Odom3dModel {
    pub noise: Odom3dNoise,
}

impl Odom3dModel {
    pub fn new(noise: Odom3dNoise) -> Self {
        Self { noise }
    }
}

fn split(d: &DVector<f64>) -> (Vector3<f64>, [f64; 4]) {
    (
        Vector3::new(d[0], d[1], d[2]),
        [d[3], d[4], d[5], d[6]],
    )
}

fn join(p: &Vector3<f64>, q: &[f64; 4]) -> DVector<f64> {
    DVector::from_row_slice(&[p.x, p.y, p.z, q[0], q[1], q[2], q[3]])
}

/// `(p1, q1) ∘ (p2, q2)`, shared by delta composition and state update.
fn compose(a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    let (p1, q1) = split(a);
    let (p2, q2) = split(b);
    let r = quaternion::rotate(&q1, p2.as_slice());
    let q = quaternion::normalize(&quaternion::mul(&q1, &q2));
    join(&(p1 + Vector3::new(r[0], r[1], r[2])), &q)
}

impl MotionModel for Odom3dModel {
    fn name(&self) -> &'static str {
        "ODOM 3D"
    }

    fn frame_structure(&self) -> FrameStructure {
        FrameStructure::Po3D
    }

    fn data_size(&self) -> usize {
        6
    }

    fn delta_size(&self) -> usize {
        7
    }

    fn delta_cov_size(&self) -> usize {
        6
    }

    fn data_to_delta(&self, data: &DVector<f64>, data_cov: &DMatrix<f64>, _dt: f64) -> Result<(DVector<f64>, DMatrix<f64>)> {
        if data.len() != 6 {
            return Err(EstimationError::dimension("odometry 3D data", 6, data.len()));
        }
        if data_cov.shape() != (6, 6) {
            return Err(EstimationError::dimension("odometry 3D data covariance", 6, data_cov.nrows()));
        }
        let dp = Vector3::new(data[0], data[1], data[2]);
        let phi = Vector3::new(data[3], data[4], data[5]);
        let dq = quaternion::from_rotvec(phi.as_slice());

        let mut j = DMatrix::identity(6, 6);
        j.view_mut((3, 3), (3, 3)).copy_from(&so3::right_jacobian(&phi));
        Ok((join(&dp, &dq), &j * data_cov * j.transpose()))
    }

    fn default_data_covariance(&self, data: &DVector<f64>, _dt: f64) -> DMatrix<f64> {
        let disp = data.rows(0, 3.min(data.len())).norm();
        let rot = if data.len() >= 6 { data.rows(3, 3).norm() } else { 0.0 };
        let mut diag = DVector::zeros(6);
        for i in 0..3 {
            diag[i] = self.noise.k_disp_to_disp * disp;
            diag[i + 3] = self.noise.k_rot_to_rot * rot;
        }
        DMatrix::from_diagonal(&diag)
    }

    fn delta_plus_delta(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64> {
        compose(d1, d2)
    }

    fn delta_plus_delta_jacobians(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let (_, q1) = split(d1);
        let (p2, q2) = split(d2);
        let r1 = quaternion::to_unit(&q1).to_rotation_matrix().into_inner();
        let r2 = quaternion::to_unit(&q2).to_rotation_matrix().into_inner();

        let mut j1 = DMatrix::identity(6, 6);
        j1.view_mut((0, 3), (3, 3)).copy_from(&(-r1 * so3::skew(&p2)));
        j1.view_mut((3, 3), (3, 3)).copy_from(&r2.transpose());

        let mut j2 = DMatrix::identity(6, 6);
        j2.view_mut((0, 0), (3, 3)).copy_from(&r1);
        (j1, j2)
    }

    fn delta_minus_delta(&self, d1: &DVector<f64>, d2: &DVector<f64>) -> DVector<f64> {
        let (p1, q1) = split(d1);
        let (p2, q2) = split(d2);
        let q1_inv = quaternion::conj(&q1);
        let diff = p2 - p1;
        let r = quaternion::rotate(&q1_inv, diff.as_slice());
        let q = quaternion::normalize(&quaternion::mul(&q1_inv, &q2));
        join(&Vector3::new(r[0], r[1], r[2]), &q)
    }

    fn x_plus_delta(&self, x: &DVector<f64>, d: &DVector<f64>) -> DVector<f64> {
        compose(x, d)
    }

    fn delta_zero(&self) -> DVector<f64> {
        DVector::from_row_slice(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0])
    }

    fn interpolate(&self, d1: &DVector<f64>, d2: &DVector<f64>, alpha: f64) -> DVector<f64> {
        let step = self.delta_minus_delta(d1, d2);
        let (dp, dq) = split(&step);
        let phi = quaternion::rotvec(&dq) * alpha;
        let scaled = join(&(dp * alpha), &quaternion::from_rotvec(phi.as_slice()));
        compose(d1, &scaled)
    }

    fn constraint_kind(&self) -> ConstraintKind {
        ConstraintKind::Odom3D
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn delta(p: [f64; 3], phi: [f64; 3]) -> DVector<f64> {
        join(&Vector3::from(p), &quaternion::from_rotvec(&phi))
    }

    #[test]
    fn test_yaw_then_forward() {
        let m = Odom3dModel::default();
        let yaw = delta([0.0; 3], [0.0, 0.0, std::f64::consts::FRAC_PI_2]);
        let fwd = delta([1.0, 0.0, 0.0], [0.0; 3]);

        let d = m.delta_plus_delta(&yaw, &fwd);
        assert_relative_eq!(d[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(d[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_composition_jacobians_match_finite_difference() {
        let m = Odom3dModel::default();
        let d1 = delta([0.3, -0.2, 0.1], [0.1, 0.2, -0.3]);
        let d2 = delta([1.0, 0.5, -0.4], [-0.2, 0.1, 0.25]);
        let (j1, _) = m.delta_plus_delta_jacobians(&d1, &d2);
        let base = m.delta_plus_delta(&d1, &d2);

        let h = 1e-7;
        for k in 0..6 {
            let mut tangent = [0.0; 6];
            tangent[k] = h;
            let perturb = delta([tangent[0], tangent[1], tangent[2]], [tangent[3], tangent[4], tangent[5]]);
            // Right perturbation of the rotation, additive position.
            let (p1, q1) = split(&d1);
            let (dp, dq) = split(&perturb);
            let d1p = join(&(p1 + dp), &quaternion::mul(&q1, &dq));
            let out = m.delta_plus_delta(&d1p, &d2);
            let (bp, bq) = split(&base);
            let (op, oq) = split(&out);
            let dpos = op - bp;
            let dth = quaternion::rotvec(&quaternion::mul(&quaternion::conj(&bq), &oq));
            for r in 0..3 {
                assert_relative_eq!(dpos[r] / h, j1[(r, k)], epsilon = 1e-5);
                assert_relative_eq!(dth[r] / h, j1[(r + 3, k)], epsilon = 1e-5);
            }
        }
    }
}
