//! Geometry utilities: SO(3) maps, quaternions, planar angles and pinhole projection.

pub mod angle;
pub mod pinhole;
pub mod quaternion;
pub mod so3;

pub use pinhole::PinholeIntrinsics;

use num_dual::DualNum;

/// Scalar type residuals are evaluated in: `f64`, or a dual number when the
/// Jacobian is obtained by automatic differentiation.
pub trait Scalar: DualNum<f64> + Copy {}

impl<T: DualNum<f64> + Copy> Scalar for T {}
