//! Planar angle helpers.

use std::f64::consts::{PI, TAU};

use super::Scalar;

/// Wrap an angle to [-π, π).
///
/// The wrap offset is chosen on the real part, so derivatives pass through
/// unchanged.
pub fn pi2pi<T: Scalar>(a: T) -> T {
    let k = ((a.re() + PI) / TAU).floor();
    a - T::from(k * TAU)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pi2pi_wraps() {
        assert_relative_eq!(pi2pi(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(pi2pi(-3.0 * PI / 2.0), PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(pi2pi(0.3), 0.3, epsilon = 1e-15);
    }
}
