//! Whitened residual evaluation and Jacobians.
//!
//! A [`CostFunction`] is the solver-facing view of a constraint: the constraint
//! kind with its constants, the measurement, and the square-root information.
//! The residual is `r = S e(x)`. Jacobians are taken per bound block in the
//! block's ambient coordinates; the solver maps them onto local
//! parameterizations.

use nalgebra::{DMatrix, DVector};
use num_dual::Dual64;

use crate::geometry::Scalar;

use super::{odom_2d, ConstraintKind};

/// How the Jacobian of a cost function is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianMethod {
    /// Forward-mode dual numbers, one seeded column at a time.
    Auto,
    /// Central finite differences.
    Numeric,
    /// Closed form. Kinds without one are evaluated with `Auto`.
    Analytic,
}

/// Relative step of the central differences.
const NUMERIC_STEP: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct CostFunction {
    kind: ConstraintKind,
    measurement: DVector<f64>,
    sqrt_information: DMatrix<f64>,
    method: JacobianMethod,
}

impl CostFunction {
    pub(crate) fn new(
        kind: ConstraintKind,
        measurement: DVector<f64>,
        sqrt_information: DMatrix<f64>,
        method: JacobianMethod,
    ) -> Self {
        Self {
            kind,
            measurement,
            sqrt_information,
            method,
        }
    }

    pub fn kind(&self) -> &ConstraintKind {
        &self.kind
    }

    pub fn method(&self) -> JacobianMethod {
        self.method
    }

    pub(crate) fn set_method(&mut self, method: JacobianMethod) {
        self.method = method;
    }

    pub fn residual_size(&self) -> usize {
        self.kind.residual_size()
    }

    pub fn block_sizes(&self) -> &'static [usize] {
        self.kind.block_sizes()
    }

    fn whiten<T: Scalar>(&self, e: &[T]) -> Vec<T> {
        let m = e.len();
        (0..m)
            .map(|i| {
                (0..m).fold(T::from(0.0), |acc, j| {
                    let s = self.sqrt_information[(i, j)];
                    if s == 0.0 {
                        acc
                    } else {
                        acc + e[j] * s
                    }
                })
            })
            .collect()
    }

    fn residual_generic<T: Scalar>(&self, blocks: &[&[T]]) -> Vec<T> {
        let e = self.kind.error(blocks, self.measurement.as_slice());
        self.whiten(&e)
    }

    /// Whitened residual at the given block values.
    pub fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64> {
        DVector::from_vec(self.residual_generic(blocks))
    }

    /// Whitened residual and one Jacobian per bound block (rows × block size).
    pub fn evaluate_with_jacobians(&self, blocks: &[&[f64]]) -> (DVector<f64>, Vec<DMatrix<f64>>) {
        let residual = self.evaluate(blocks);
        let jacobians = match self.method {
            JacobianMethod::Analytic if self.kind.has_analytic_jacobian() => self.analytic_jacobians(blocks),
            JacobianMethod::Numeric => self.numeric_jacobians(blocks),
            _ => self.auto_jacobians(blocks),
        };
        (residual, jacobians)
    }

    fn auto_jacobians(&self, blocks: &[&[f64]]) -> Vec<DMatrix<f64>> {
        let m = self.residual_size();
        let duals: Vec<Vec<Dual64>> = blocks
            .iter()
            .map(|b| b.iter().map(|v| Dual64::from(*v)).collect())
            .collect();

        let mut jacobians = Vec::with_capacity(blocks.len());
        for (bi, block) in blocks.iter().enumerate() {
            let mut jac = DMatrix::zeros(m, block.len());
            for k in 0..block.len() {
                let mut seeded = duals.clone();
                seeded[bi][k] = Dual64::new(block[k], 1.0);
                let refs: Vec<&[Dual64]> = seeded.iter().map(|v| v.as_slice()).collect();
                let r = self.residual_generic(&refs);
                for (i, ri) in r.iter().enumerate() {
                    jac[(i, k)] = ri.eps;
                }
            }
            jacobians.push(jac);
        }
        jacobians
    }

    fn numeric_jacobians(&self, blocks: &[&[f64]]) -> Vec<DMatrix<f64>> {
        let m = self.residual_size();
        let mut values: Vec<Vec<f64>> = blocks.iter().map(|b| b.to_vec()).collect();

        let mut jacobians = Vec::with_capacity(blocks.len());
        for bi in 0..values.len() {
            let mut jac = DMatrix::zeros(m, values[bi].len());
            for k in 0..values[bi].len() {
                let x = values[bi][k];
                let h = NUMERIC_STEP * x.abs().max(1.0);

                values[bi][k] = x + h;
                let plus = self.residual_at(&values);
                values[bi][k] = x - h;
                let minus = self.residual_at(&values);
                values[bi][k] = x;

                for i in 0..m {
                    jac[(i, k)] = (plus[i] - minus[i]) / (2.0 * h);
                }
            }
            jacobians.push(jac);
        }
        jacobians
    }

    fn residual_at(&self, values: &[Vec<f64>]) -> Vec<f64> {
        let refs: Vec<&[f64]> = values.iter().map(|v| v.as_slice()).collect();
        self.residual_generic(&refs)
    }

    fn analytic_jacobians(&self, blocks: &[&[f64]]) -> Vec<DMatrix<f64>> {
        let raw = match self.kind {
            ConstraintKind::Fix2D => vec![-DMatrix::identity(2, 2)],
            ConstraintKind::Odom2D => odom_2d::jacobians(blocks),
            _ => return self.auto_jacobians(blocks),
        };
        raw.into_iter().map(|j| &self.sqrt_information * j).collect()
    }
}

/// Huber robust loss on the whitened residual norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HuberLoss {
    pub threshold: f64,
}

impl HuberLoss {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// IRLS weight for a residual of the given norm.
    pub fn weight(&self, norm: f64) -> f64 {
        if norm <= self.threshold {
            1.0
        } else {
            self.threshold / norm
        }
    }

    /// ρ(s) for squared norm s.
    pub fn rho(&self, squared_norm: f64) -> f64 {
        let norm = squared_norm.sqrt();
        if norm <= self.threshold {
            squared_norm
        } else {
            2.0 * self.threshold * norm - self.threshold * self.threshold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::image_ahp::CameraModel;
    use crate::geometry::{quaternion, PinholeIntrinsics};
    use approx::assert_relative_eq;

    fn ahp_cost(method: JacobianMethod) -> CostFunction {
        let kind = ConstraintKind::ImageAhp(CameraModel {
            intrinsics: PinholeIntrinsics::new(320.0, 240.0, 450.0, 460.0),
            extrinsic_p: [0.1, 0.0, 0.05],
            extrinsic_o: quaternion::from_rotvec(&[0.0, 0.05, 0.0]),
        });
        CostFunction::new(
            kind,
            DVector::from_row_slice(&[300.0, 250.0]),
            DMatrix::identity(2, 2) * 0.5,
            method,
        )
    }

    fn ahp_blocks() -> Vec<Vec<f64>> {
        let q = quaternion::from_rotvec(&[0.02, -0.1, 0.3]);
        let qa = quaternion::from_rotvec(&[0.0, 0.05, 0.2]);
        let m = nalgebra::Vector3::new(0.1, -0.05, 1.0).normalize();
        vec![
            vec![0.4, 0.1, 0.0],
            q.to_vec(),
            vec![0.0, 0.0, 0.0],
            qa.to_vec(),
            vec![m.x, m.y, m.z, 0.3],
        ]
    }

    #[test]
    fn test_auto_and_numeric_jacobians_agree() {
        let blocks = ahp_blocks();
        let refs: Vec<&[f64]> = blocks.iter().map(|b| b.as_slice()).collect();

        let (r_auto, j_auto) = ahp_cost(JacobianMethod::Auto).evaluate_with_jacobians(&refs);
        let (r_num, j_num) = ahp_cost(JacobianMethod::Numeric).evaluate_with_jacobians(&refs);

        assert_relative_eq!(r_auto, r_num, epsilon = 1e-12);
        for (a, n) in j_auto.iter().zip(j_num.iter()) {
            assert_eq!(a.shape(), n.shape());
            assert_relative_eq!(a, n, epsilon = 1e-4, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_odom_2d_analytic_matches_auto() {
        let meas = DVector::from_row_slice(&[0.8, 0.1, 0.2]);
        let sqrt_info = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 0.0, 0.3, 1.5, 0.0, 0.0, 0.2, 4.0]);
        let blocks: Vec<Vec<f64>> = vec![vec![1.0, -2.0], vec![0.7], vec![1.5, -1.1], vec![1.0]];
        let refs: Vec<&[f64]> = blocks.iter().map(|b| b.as_slice()).collect();

        let analytic = CostFunction::new(ConstraintKind::Odom2D, meas.clone(), sqrt_info.clone(), JacobianMethod::Analytic);
        let auto = CostFunction::new(ConstraintKind::Odom2D, meas, sqrt_info, JacobianMethod::Auto);

        let (_, ja) = analytic.evaluate_with_jacobians(&refs);
        let (_, jd) = auto.evaluate_with_jacobians(&refs);
        for (a, d) in ja.iter().zip(jd.iter()) {
            assert_relative_eq!(a, d, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_fix_2d_residual_is_whitened() {
        let cost = CostFunction::new(
            ConstraintKind::Fix2D,
            DVector::from_row_slice(&[5.0, 0.0]),
            DMatrix::identity(2, 2) * 2.0,
            JacobianMethod::Analytic,
        );

        let (r, j) = cost.evaluate_with_jacobians(&[&[6.0, 0.0]]);
        assert_relative_eq!(r[0], -2.0);
        assert_relative_eq!(j[0], -DMatrix::identity(2, 2) * 2.0);
    }

    #[test]
    fn test_huber_weight() {
        let loss = HuberLoss::new(1.0);

        assert_eq!(loss.weight(0.5), 1.0);
        assert_relative_eq!(loss.weight(4.0), 0.25);
        assert_relative_eq!(loss.rho(9.0), 5.0);
    }
}
