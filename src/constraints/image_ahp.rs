//! Pixel observation of an anchored homogeneous point.
//!
//! Blocks `[p (3), q (4), p_anchor (3), q_anchor (4), landmark (4)]`, where the
//! landmark is `(m, ρ)`: a bearing in the anchor camera and an inverse
//! distance. With camera poses `T_wc = T_wr T_rc`:
//!
//! ```text
//! v = R_wc1ᵀ (R_wc0 m + (t_wc0 - t_wc1) ρ)
//! u = (u0 + αu vx/vz, v0 + αv vy/vz)
//! e = u - meas
//! ```
//!
//! Points at infinity (ρ = 0) remain well defined.

use crate::geometry::quaternion;
use crate::geometry::{PinholeIntrinsics, Scalar};

pub const BLOCK_SIZES: &[usize] = &[3, 4, 3, 4, 4];
pub const RESIDUAL_SIZE: usize = 2;
pub const MEASUREMENT_SIZE: usize = 2;

/// Fixed camera parameters of the observing sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub intrinsics: PinholeIntrinsics,
    /// Camera position in the robot frame.
    pub extrinsic_p: [f64; 3],
    /// Camera orientation in the robot frame, `[x, y, z, w]`.
    pub extrinsic_o: [f64; 4],
}

fn camera_pose<T: Scalar>(p: &[T], q: &[T], cam: &CameraModel) -> ([T; 3], [T; 4]) {
    let pc: Vec<T> = cam.extrinsic_p.iter().map(|v| T::from(*v)).collect();
    let qc: Vec<T> = cam.extrinsic_o.iter().map(|v| T::from(*v)).collect();
    let offset = quaternion::rotate(q, &pc);
    (
        [p[0] + offset[0], p[1] + offset[1], p[2] + offset[2]],
        quaternion::mul(q, &qc),
    )
}

/// Landmark expressed in the observing camera, homogeneous scale `ρ`.
pub fn point_in_camera<T: Scalar>(blocks: &[&[T]], cam: &CameraModel) -> [T; 3] {
    let (t1, q1) = camera_pose(blocks[0], blocks[1], cam);
    let (t0, q0) = camera_pose(blocks[2], blocks[3], cam);
    let lmk = blocks[4];
    let rho = lmk[3];

    let m_w = quaternion::rotate(&q0, &lmk[0..3]);
    let mut x_w = [T::from(0.0); 3];
    for i in 0..3 {
        x_w[i] = m_w[i] + (t0[i] - t1[i]) * rho;
    }
    quaternion::rotate(&quaternion::conj(&q1), &x_w)
}

pub fn error<T: Scalar>(blocks: &[&[T]], meas: &[f64], cam: &CameraModel) -> Vec<T> {
    let v = point_in_camera(blocks, cam);
    let k = &cam.intrinsics;
    let u = T::from(k.u0) + v[0] / v[2] * k.alpha_u;
    let w = T::from(k.v0) + v[1] / v[2] * k.alpha_v;
    vec![u - meas[0], w - meas[1]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Vector2, Vector3};

    fn camera() -> CameraModel {
        CameraModel {
            intrinsics: PinholeIntrinsics::new(320.0, 240.0, 400.0, 400.0),
            extrinsic_p: [0.0; 3],
            extrinsic_o: [0.0, 0.0, 0.0, 1.0],
        }
    }

    #[test]
    fn test_anchor_observation_reprojects_to_pixel() {
        let cam = camera();
        let pixel = Vector2::new(350.0, 200.0);
        let m = cam.intrinsics.bearing(&pixel);
        let q = [0.0, 0.0, 0.0, 1.0];
        let p = [1.0, 2.0, 3.0];
        let lmk = [m.x, m.y, m.z, 0.25];

        let e = error::<f64>(&[&p, &q, &p, &q, &lmk], &[pixel.x, pixel.y], &cam);
        assert_relative_eq!(e[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(e[1], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_translated_observer_sees_parallax() {
        let cam = camera();
        let q = [0.0, 0.0, 0.0, 1.0];
        let anchor = [0.0, 0.0, 0.0];
        let observer = [0.5, 0.0, 0.0];
        // Point straight ahead at distance 2.
        let lmk = [0.0, 0.0, 1.0, 0.5];

        let v = point_in_camera::<f64>(&[&observer, &q, &anchor, &q, &lmk], &cam);
        let v = Vector3::new(v[0], v[1], v[2]) / 0.5;
        assert_relative_eq!(v, Vector3::new(-0.5, 0.0, 2.0), epsilon = 1e-12);
    }
}
