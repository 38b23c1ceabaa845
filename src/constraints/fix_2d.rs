//! Absolute planar position fix.
//!
//! Binds the position block of one frame. The error is `meas - p`, so a fix at
//! 5 against a position of 6 with unit variance yields a residual of -1.

use crate::geometry::Scalar;

pub const BLOCK_SIZES: &[usize] = &[2];
pub const RESIDUAL_SIZE: usize = 2;
pub const MEASUREMENT_SIZE: usize = 2;

pub fn error<T: Scalar>(blocks: &[&[T]], meas: &[f64]) -> Vec<T> {
    let p = blocks[0];
    vec![T::from(meas[0]) - p[0], T::from(meas[1]) - p[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_sign() {
        let e = error::<f64>(&[&[6.0, 1.0]], &[5.0, 1.0]);
        assert_eq!(e, vec![-1.0, 0.0]);
    }
}
