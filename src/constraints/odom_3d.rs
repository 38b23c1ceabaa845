//! Relative spatial motion between two frames.
//!
//! Blocks `[p1 (3), q1 (4), p2 (3), q2 (4)]`; the measurement is `(dp, dq)`,
//! the pose of frame 2 in frame 1. The error is 6-D: position error in frame 1
//! followed by the rotation vector of `dq⁻¹ q1⁻¹ q2`.

use crate::geometry::quaternion;
use crate::geometry::Scalar;

pub const BLOCK_SIZES: &[usize] = &[3, 4, 3, 4];
pub const RESIDUAL_SIZE: usize = 6;
pub const MEASUREMENT_SIZE: usize = 7;

pub fn error<T: Scalar>(blocks: &[&[T]], meas: &[f64]) -> Vec<T> {
    let (p1, q1, p2, q2) = (blocks[0], blocks[1], blocks[2], blocks[3]);
    let q1_inv = quaternion::conj(q1);

    let d = [p2[0] - p1[0], p2[1] - p1[1], p2[2] - p1[2]];
    let dp = quaternion::rotate(&q1_inv, &d);

    let dq_meas: Vec<T> = meas[3..7].iter().map(|v| T::from(*v)).collect();
    let dq = quaternion::mul(&q1_inv, q2);
    let err_q = quaternion::mul(&quaternion::conj(&dq_meas), &dq);
    let dtheta = quaternion::to_rotvec(&err_q);

    vec![
        dp[0] - meas[0],
        dp[1] - meas[1],
        dp[2] - meas[2],
        dtheta[0],
        dtheta[1],
        dtheta[2],
    ]
}
