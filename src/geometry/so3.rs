//! SO(3) utilities for motion composition and covariance propagation.
//!
//! Rotation vectors φ map to rotations through the exponential map; the right
//! Jacobian Jr(φ) relates small perturbations of φ to perturbations of Exp(φ),
//! following Forster et al. "On-Manifold Preintegration".

use nalgebra::{Matrix3, Vector3};

/// Below this angle the closed forms switch to their series expansions.
const SMALL_ANGLE: f64 = 1e-6;

/// Skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    #[rustfmt::skip]
    let m = Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    );
    m
}

/// Right Jacobian of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²,   θ = |φ|
/// ```
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_x = skew(phi);

    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * phi_x;
    }

    let theta2 = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta2) * phi_x
        + ((theta - theta.sin()) / (theta2 * theta)) * phi_x * phi_x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn exp(phi: &Vector3<f64>) -> Matrix3<f64> {
        Rotation3::new(*phi).into_inner()
    }

    #[test]
    fn test_skew_matches_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(-4.0, 0.5, 6.0);

        assert_relative_eq!(skew(&v) * u, v.cross(&u), epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_is_identity_at_zero() {
        assert_relative_eq!(right_jacobian(&Vector3::zeros()), Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_first_order() {
        // Exp(φ + δ) ≈ Exp(φ) Exp(Jr(φ) δ)
        let phi = Vector3::new(0.4, -0.1, 0.25);
        let delta = Vector3::new(1e-6, -2e-6, 1.5e-6);

        let lhs = exp(&(phi + delta));
        let rhs = exp(&phi) * exp(&(right_jacobian(&phi) * delta));
        assert_relative_eq!(lhs, rhs, epsilon = 1e-11);
    }
}
