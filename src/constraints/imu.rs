//! Preintegrated inertial constraint between two frames with velocity.
//!
//! Blocks `[p1 (3), q1 (4), v1 (3), p2 (3), q2 (4), v2 (3)]`. The measurement
//! is the preintegrated delta `(dp, dq, dv, dt)`:
//!
//! ```text
//! e_p = R1ᵀ (p2 - p1 - v1 dt - ½ g dt²) - dp
//! e_θ = Log(dq⁻¹ q1⁻¹ q2)
//! e_v = R1ᵀ (v2 - v1 - g dt) - dv
//! ```

use crate::geometry::quaternion;
use crate::geometry::Scalar;

pub const BLOCK_SIZES: &[usize] = &[3, 4, 3, 3, 4, 3];
pub const RESIDUAL_SIZE: usize = 9;
pub const MEASUREMENT_SIZE: usize = 11;

pub fn error<T: Scalar>(blocks: &[&[T]], meas: &[f64], gravity: &[f64; 3]) -> Vec<T> {
    let (p1, q1, v1) = (blocks[0], blocks[1], blocks[2]);
    let (p2, q2, v2) = (blocks[3], blocks[4], blocks[5]);
    let dt = meas[10];
    let q1_inv = quaternion::conj(q1);

    let mut dp_world = [T::from(0.0); 3];
    let mut dv_world = [T::from(0.0); 3];
    for i in 0..3 {
        dp_world[i] = p2[i] - p1[i] - v1[i] * dt - T::from(0.5 * gravity[i] * dt * dt);
        dv_world[i] = v2[i] - v1[i] - T::from(gravity[i] * dt);
    }
    let dp = quaternion::rotate(&q1_inv, &dp_world);
    let dv = quaternion::rotate(&q1_inv, &dv_world);

    let dq_meas: Vec<T> = meas[3..7].iter().map(|v| T::from(*v)).collect();
    let err_q = quaternion::mul(&quaternion::conj(&dq_meas), &quaternion::mul(&q1_inv, q2));
    let dtheta = quaternion::to_rotvec(&err_q);

    vec![
        dp[0] - meas[0],
        dp[1] - meas[1],
        dp[2] - meas[2],
        dtheta[0],
        dtheta[1],
        dtheta[2],
        dv[0] - meas[7],
        dv[1] - meas[8],
        dv[2] - meas[9],
    ]
}
