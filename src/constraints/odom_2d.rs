//! Relative planar motion between two frames.
//!
//! Blocks `[p1 (2), θ1 (1), p2 (2), θ2 (1)]`; the measurement is the motion of
//! frame 2 expressed in frame 1, `(dx, dy, dθ)`.

use nalgebra::DMatrix;

use crate::geometry::angle::pi2pi;
use crate::geometry::Scalar;

pub const BLOCK_SIZES: &[usize] = &[2, 1, 2, 1];
pub const RESIDUAL_SIZE: usize = 3;
pub const MEASUREMENT_SIZE: usize = 3;

pub fn error<T: Scalar>(blocks: &[&[T]], meas: &[f64]) -> Vec<T> {
    let (p1, o1, p2, o2) = (blocks[0], blocks[1][0], blocks[2], blocks[3][0]);
    let (c, s) = (o1.cos(), o1.sin());
    let dx = p2[0] - p1[0];
    let dy = p2[1] - p1[1];
    vec![
        c * dx + s * dy - meas[0],
        c * dy - s * dx - meas[1],
        pi2pi(o2 - o1 - meas[2]),
    ]
}

/// Closed-form Jacobians of [`error`] with respect to each block.
pub fn jacobians(blocks: &[&[f64]]) -> Vec<DMatrix<f64>> {
    let (p1, o1, p2) = (blocks[0], blocks[1][0], blocks[2]);
    let (c, s) = (o1.cos(), o1.sin());
    let dx = p2[0] - p1[0];
    let dy = p2[1] - p1[1];

    #[rustfmt::skip]
    let j_p1 = DMatrix::from_row_slice(3, 2, &[
        -c, -s,
         s, -c,
        0.0, 0.0,
    ]);
    let j_o1 = DMatrix::from_row_slice(3, 1, &[-s * dx + c * dy, -c * dx - s * dy, -1.0]);
    #[rustfmt::skip]
    let j_p2 = DMatrix::from_row_slice(3, 2, &[
         c,  s,
        -s,  c,
        0.0, 0.0,
    ]);
    let j_o2 = DMatrix::from_row_slice(3, 1, &[0.0, 0.0, 1.0]);
    vec![j_p1, j_o1, j_p2, j_o2]
}
