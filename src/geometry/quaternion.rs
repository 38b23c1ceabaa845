//! Quaternion helpers generic over the residual scalar type.
//!
//! Quaternions are stored as `[x, y, z, w]`, the same order nalgebra uses for
//! its coordinate storage. The functions take slices so they operate directly
//! on state-block storage, both for plain `f64` and for dual numbers during
//! automatic differentiation.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use super::Scalar;

/// Below this half-angle norm the exponential and logarithm use series forms.
const SMALL_NORM: f64 = 1e-9;

/// Hamilton product `a ⊗ b`.
pub fn mul<T: Scalar>(a: &[T], b: &[T]) -> [T; 4] {
    let (ax, ay, az, aw) = (a[0], a[1], a[2], a[3]);
    let (bx, by, bz, bw) = (b[0], b[1], b[2], b[3]);
    [
        aw * bx + ax * bw + ay * bz - az * by,
        aw * by - ax * bz + ay * bw + az * bx,
        aw * bz + ax * by - ay * bx + az * bw,
        aw * bw - ax * bx - ay * by - az * bz,
    ]
}

/// Conjugate, equal to the inverse for unit quaternions.
pub fn conj<T: Scalar>(q: &[T]) -> [T; 4] {
    [-q[0], -q[1], -q[2], q[3]]
}

pub fn normalize<T: Scalar>(q: &[T]) -> [T; 4] {
    let n = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    [q[0] / n, q[1] / n, q[2] / n, q[3] / n]
}

/// Rotate a 3-vector: `q v q*`.
pub fn rotate<T: Scalar>(q: &[T], v: &[T]) -> [T; 3] {
    // v' = v + 2w (u × v) + 2 u × (u × v), u = vector part
    let (ux, uy, uz, w) = (q[0], q[1], q[2], q[3]);
    let tx = (uy * v[2] - uz * v[1]) * 2.0;
    let ty = (uz * v[0] - ux * v[2]) * 2.0;
    let tz = (ux * v[1] - uy * v[0]) * 2.0;
    [
        v[0] + w * tx + (uy * tz - uz * ty),
        v[1] + w * ty + (uz * tx - ux * tz),
        v[2] + w * tz + (ux * ty - uy * tx),
    ]
}

/// Exponential map: rotation vector → unit quaternion.
pub fn from_rotvec<T: Scalar>(v: &[T]) -> [T; 4] {
    let theta2 = v[0] * v[0] + v[1] * v[1] + v[2] * v[2];
    if theta2.re() < SMALL_NORM * SMALL_NORM {
        let half = T::from(0.5);
        return normalize(&[v[0] * half, v[1] * half, v[2] * half, T::from(1.0)]);
    }
    let theta = theta2.sqrt();
    let half = theta * 0.5;
    let k = half.sin() / theta;
    [v[0] * k, v[1] * k, v[2] * k, half.cos()]
}

/// Logarithmic map: unit quaternion → rotation vector with angle in [0, π].
pub fn to_rotvec<T: Scalar>(q: &[T]) -> [T; 3] {
    // q and -q are the same rotation; pick the short way round.
    let q = if q[3].re() < 0.0 {
        [-q[0], -q[1], -q[2], -q[3]]
    } else {
        [q[0], q[1], q[2], q[3]]
    };
    let n2 = q[0] * q[0] + q[1] * q[1] + q[2] * q[2];
    if n2.re() < SMALL_NORM * SMALL_NORM {
        let two = T::from(2.0) / q[3];
        return [q[0] * two, q[1] * two, q[2] * two];
    }
    let n = n2.sqrt();
    let half_angle = if q[3].re() > SMALL_NORM {
        (n / q[3]).atan()
    } else {
        T::from(std::f64::consts::FRAC_PI_2)
    };
    let k = half_angle * 2.0 / n;
    [q[0] * k, q[1] * k, q[2] * k]
}

/// Convert `[x, y, z, w]` storage into an nalgebra unit quaternion.
pub fn to_unit(q: &[f64]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]))
}

/// Convert an nalgebra unit quaternion into `[x, y, z, w]` storage.
pub fn from_unit(q: &UnitQuaternion<f64>) -> [f64; 4] {
    let c = q.coords;
    [c[0], c[1], c[2], c[3]]
}

/// Rotation vector of an `[x, y, z, w]` quaternion as an nalgebra vector.
pub fn rotvec(q: &[f64]) -> Vector3<f64> {
    let r = to_rotvec(q);
    Vector3::new(r[0], r[1], r[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mul_matches_nalgebra() {
        let a = UnitQuaternion::from_euler_angles(0.1, -0.4, 0.7);
        let b = UnitQuaternion::from_euler_angles(-0.3, 0.2, 1.1);

        let ours = mul(&from_unit(&a), &from_unit(&b));
        let theirs = from_unit(&(a * b));
        for i in 0..4 {
            assert_relative_eq!(ours[i], theirs[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rotate_matches_nalgebra() {
        let q = UnitQuaternion::from_euler_angles(0.5, 0.1, -0.8);
        let v = Vector3::new(1.0, -2.0, 0.5);

        let ours = rotate(&from_unit(&q), &[v.x, v.y, v.z]);
        let theirs = q * v;
        assert_relative_eq!(Vector3::new(ours[0], ours[1], ours[2]), theirs, epsilon = 1e-12);
    }

    #[test]
    fn test_rotvec_roundtrip() {
        let v = [0.2, -0.7, 1.3];
        let back = to_rotvec(&from_rotvec(&v));

        for i in 0..3 {
            assert_relative_eq!(back[i], v[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rotvec_of_negated_quaternion() {
        let q = from_rotvec(&[0.0, 0.0, 0.5]);
        let neg = [-q[0], -q[1], -q[2], -q[3]];

        assert_relative_eq!(rotvec(&neg), Vector3::new(0.0, 0.0, 0.5), epsilon = 1e-12);
    }

    #[test]
    fn test_small_angle_branch() {
        let v = [1e-12, 0.0, -2e-12];
        let q = from_rotvec(&v);

        assert_relative_eq!(q[3], 1.0, epsilon = 1e-15);
        assert_relative_eq!(to_rotvec(&q)[2], -2e-12, epsilon = 1e-20);
    }
}
