//! Levenberg–Marquardt backend over registered state and residual blocks.
//!
//! The optimization variable is the stack of local increments `δ` of all free
//! parameter blocks, around the values they had when the solve started:
//!
//! ```text
//! x_i(δ) = x_i ⊞ δ_i          (quaternion blocks: q ⊗ exp(δ/2))
//! E(δ)   = ½ Σ_k w_k ‖r_k(x(δ))‖²
//! ```
//!
//! Each residual `r_k` is already whitened by its constraint. Constraints with
//! a loss function are reweighted with the Huber weight `w_k` of their current
//! norm. Jacobians of quaternion blocks are chained through the plus Jacobian
//! so every column lives in tangent space.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use tracing::{debug, trace};

use crate::constraints::{CostFunction, HuberLoss};
use crate::error::{EstimationError, Result};
use crate::graph::{ConstraintId, LocalParameterization, StateBlockId, StateBlockStore};

use super::solver::{Solver, SolverOptions, SolverSummary};

#[derive(Debug, Clone, Copy)]
struct ParameterBlock {
    size: usize,
    local: Option<LocalParameterization>,
}

#[derive(Debug, Clone)]
struct ResidualBlock {
    cost: CostFunction,
    loss: Option<HuberLoss>,
    blocks: Vec<StateBlockId>,
}

/// Free block of one solve: where its increment lives in `δ`.
#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    offset: usize,
    local_size: usize,
    local: Option<LocalParameterization>,
}

#[derive(Debug, Default)]
pub struct LmSolver {
    parameters: BTreeMap<StateBlockId, ParameterBlock>,
    residuals: BTreeMap<ConstraintId, ResidualBlock>,
}

impl LmSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_parameter_block(&self, id: StateBlockId) -> bool {
        self.parameters.contains_key(&id)
    }

    pub fn has_residual_block(&self, id: ConstraintId) -> bool {
        self.residuals.contains_key(&id)
    }
}

impl Solver for LmSolver {
    fn register_parameter_block(&mut self, id: StateBlockId, size: usize, local: Option<LocalParameterization>) -> Result<()> {
        if self.parameters.contains_key(&id) {
            return Err(EstimationError::InvalidTopology(format!(
                "parameter block {} registered twice",
                id
            )));
        }
        self.parameters.insert(id, ParameterBlock { size, local });
        Ok(())
    }

    fn remove_parameter_block(&mut self, id: StateBlockId) -> Result<()> {
        self.parameters
            .remove(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("parameter block {}", id)))?;
        self.residuals.retain(|_, r| !r.blocks.contains(&id));
        Ok(())
    }

    fn register_residual_block(
        &mut self,
        id: ConstraintId,
        cost: CostFunction,
        loss: Option<HuberLoss>,
        blocks: &[StateBlockId],
    ) -> Result<()> {
        if blocks.len() != cost.block_sizes().len() {
            return Err(EstimationError::dimension(
                format!("residual {} block count", id),
                cost.block_sizes().len(),
                blocks.len(),
            ));
        }
        for (b, want) in blocks.iter().zip(cost.block_sizes()) {
            let p = self
                .parameters
                .get(b)
                .ok_or_else(|| EstimationError::NotFound(format!("parameter block {}", b)))?;
            if p.size != *want {
                return Err(EstimationError::dimension(format!("residual {} block {}", id, b), *want, p.size));
            }
        }
        self.residuals.insert(
            id,
            ResidualBlock {
                cost,
                loss,
                blocks: blocks.to_vec(),
            },
        );
        Ok(())
    }

    fn remove_residual_block(&mut self, id: ConstraintId) -> Result<()> {
        self.residuals
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EstimationError::NotFound(format!("residual block {}", id)))
    }

    fn num_parameter_blocks(&self) -> usize {
        self.parameters.len()
    }

    fn num_residual_blocks(&self) -> usize {
        self.residuals.len()
    }

    fn solve(&mut self, states: &mut StateBlockStore, options: &SolverOptions) -> Result<SolverSummary> {
        let start = Instant::now();

        // Blocks no residual touches are left out of the increment.
        let used: HashSet<StateBlockId> = self.residuals.values().flat_map(|r| r.blocks.iter().copied()).collect();
        let mut base = HashMap::with_capacity(self.parameters.len());
        let mut free = HashMap::new();
        let mut dim = 0;
        for (id, p) in &self.parameters {
            let block = states.get(*id)?;
            base.insert(*id, block.values().clone());
            if !block.is_fixed() && used.contains(id) {
                let local_size = p.local.map_or(p.size, |l| l.local_size());
                free.insert(
                    *id,
                    FreeBlock {
                        offset: dim,
                        local_size,
                        local: p.local,
                    },
                );
                dim += local_size;
            }
        }

        let problem = LmProblem {
            base: &base,
            free: &free,
            terms: self.residuals.values().collect(),
            residual_dim: self.residuals.values().map(|r| r.cost.residual_size()).sum(),
            delta: DVector::zeros(dim),
        };
        let initial_cost = problem.cost();

        if dim == 0 || problem.terms.is_empty() {
            return Ok(SolverSummary {
                converged: true,
                iterations: 0,
                initial_cost,
                final_cost: initial_cost,
                wall_time: start.elapsed(),
                termination: "nothing to optimize".to_string(),
            });
        }
        debug!(
            "[LmSolver] Solving {} parameters, {} residual blocks ({} rows)",
            dim,
            problem.terms.len(),
            problem.residual_dim
        );

        let lm = LevenbergMarquardt::new()
            .with_ftol(options.ftol)
            .with_xtol(options.xtol)
            .with_gtol(options.gtol)
            .with_patience(options.max_iterations.max(1));
        let (problem, report) = lm.minimize(problem);

        let final_cost = problem.cost();
        let values = problem.values();
        for (id, v) in values {
            states.get_mut(id)?.set_values(v.as_slice())?;
        }
        trace!("[LmSolver] termination: {:?}", report.termination);

        Ok(SolverSummary {
            converged: report.termination.was_successful(),
            iterations: report.number_of_evaluations,
            initial_cost,
            final_cost,
            wall_time: start.elapsed(),
            termination: format!("{:?}", report.termination),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Least-squares problem
// ─────────────────────────────────────────────────────────────────────────────

struct LmProblem<'a> {
    base: &'a HashMap<StateBlockId, DVector<f64>>,
    free: &'a HashMap<StateBlockId, FreeBlock>,
    terms: Vec<&'a ResidualBlock>,
    residual_dim: usize,
    delta: DVector<f64>,
}

impl<'a> LmProblem<'a> {
    /// Block values at the current increment.
    fn value(&self, id: StateBlockId) -> DVector<f64> {
        let x = &self.base[&id];
        match self.free.get(&id) {
            None => x.clone(),
            Some(f) => {
                let d = &self.delta.as_slice()[f.offset..f.offset + f.local_size];
                match f.local {
                    Some(l) => l.plus(x.as_slice(), d),
                    None => x + DVector::from_column_slice(d),
                }
            }
        }
    }

    fn values(&self) -> Vec<(StateBlockId, DVector<f64>)> {
        self.free.keys().map(|id| (*id, self.value(*id))).collect()
    }

    fn block_values(&self, r: &ResidualBlock) -> Vec<DVector<f64>> {
        r.blocks.iter().map(|b| self.value(*b)).collect()
    }

    /// Square root of the loss weight of a whitened residual.
    fn loss_scale(r: &ResidualBlock, residual: &DVector<f64>) -> f64 {
        r.loss.map_or(1.0, |l| l.weight(residual.norm()).sqrt())
    }

    fn cost(&self) -> f64 {
        self.residuals().map_or(f64::INFINITY, |r| 0.5 * r.norm_squared())
    }
}

impl<'a> LeastSquaresProblem<f64, Dyn, Dyn> for LmProblem<'a> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.delta.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.delta.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut out = DVector::zeros(self.residual_dim);
        let mut row = 0;
        for r in &self.terms {
            let values = self.block_values(r);
            let refs: Vec<&[f64]> = values.iter().map(|v| v.as_slice()).collect();
            let e = r.cost.evaluate(&refs);
            let scale = Self::loss_scale(r, &e);
            out.rows_mut(row, e.len()).copy_from(&(e * scale));
            row += r.cost.residual_size();
        }
        Some(out)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut out = DMatrix::zeros(self.residual_dim, self.delta.len());
        let mut row = 0;
        for r in &self.terms {
            let values = self.block_values(r);
            let refs: Vec<&[f64]> = values.iter().map(|v| v.as_slice()).collect();
            let (e, jacobians) = r.cost.evaluate_with_jacobians(&refs);
            let scale = Self::loss_scale(r, &e);
            let m = e.len();

            for ((b, j), x) in r.blocks.iter().zip(&jacobians).zip(&values) {
                let Some(f) = self.free.get(b) else {
                    continue;
                };
                let j_local = match f.local {
                    Some(l) => j * l.plus_jacobian(x.as_slice()),
                    None => j.clone(),
                };
                // The same block may be bound twice: accumulate.
                let mut view = out.view_mut((row, f.offset), (m, f.local_size));
                view += j_local * scale;
            }
            row += m;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{Constraint, ConstraintKind};
    use crate::graph::{Feature, FeatureKind, StateBlock, StateOwner};
    use approx::assert_relative_eq;

    fn fix_2d(meas: [f64; 2], block: StateBlockId) -> (ConstraintId, CostFunction) {
        let f = Feature::new(FeatureKind::Fix, DVector::from_row_slice(&meas), DMatrix::identity(2, 2)).unwrap();
        let c = Constraint::new(ConstraintKind::Fix2D, &f, &[(block, 2)]).unwrap();
        (c.id, c.cost().clone())
    }

    fn owner() -> StateOwner {
        StateOwner::Frame(crate::graph::FrameId::next())
    }

    #[test]
    fn test_fix_pulls_position() {
        let mut store = StateBlockStore::new();
        let id = StateBlockId::next();
        store.insert(StateBlock::new(id, owner(), DVector::from_row_slice(&[6.0, 5.0]), false));

        let mut solver = LmSolver::new();
        solver.register_parameter_block(id, 2, None).unwrap();
        let (cid, cost) = fix_2d([5.0, 5.0], id);
        solver.register_residual_block(cid, cost, None, &[id]).unwrap();

        let summary = solver.solve(&mut store, &SolverOptions::default()).unwrap();

        assert!(summary.converged);
        assert_relative_eq!(summary.initial_cost, 0.5, epsilon = 1e-12);
        assert!(summary.final_cost < 1e-12);
        assert_relative_eq!(store.get(id).unwrap().values()[0], 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_fixed_block_untouched() {
        let mut store = StateBlockStore::new();
        let id = StateBlockId::next();
        store.insert(StateBlock::new(id, owner(), DVector::from_row_slice(&[6.0, 5.0]), true));

        let mut solver = LmSolver::new();
        solver.register_parameter_block(id, 2, None).unwrap();
        let (cid, cost) = fix_2d([5.0, 5.0], id);
        solver.register_residual_block(cid, cost, None, &[id]).unwrap();

        let summary = solver.solve(&mut store, &SolverOptions::default()).unwrap();

        assert_eq!(summary.iterations, 0);
        assert_relative_eq!(store.get(id).unwrap().values()[0], 6.0);
    }

    #[test]
    fn test_two_fixes_average() {
        let mut store = StateBlockStore::new();
        let id = StateBlockId::next();
        store.insert(StateBlock::new(id, owner(), DVector::zeros(2), false));

        let mut solver = LmSolver::new();
        solver.register_parameter_block(id, 2, None).unwrap();
        for meas in [[1.0, 0.0], [3.0, 2.0]] {
            let (cid, cost) = fix_2d(meas, id);
            solver.register_residual_block(cid, cost, None, &[id]).unwrap();
        }
        solver.solve(&mut store, &SolverOptions::default()).unwrap();

        let x = store.get(id).unwrap().values();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_huber_limits_outlier_influence() {
        let mut store = StateBlockStore::new();
        let id = StateBlockId::next();
        store.insert(StateBlock::new(id, owner(), DVector::zeros(2), false));

        let mut solver = LmSolver::new();
        solver.register_parameter_block(id, 2, None).unwrap();
        for _ in 0..3 {
            let (cid, cost) = fix_2d([0.0, 0.0], id);
            solver.register_residual_block(cid, cost, Some(HuberLoss::new(1.0)), &[id]).unwrap();
        }
        let (cid, cost) = fix_2d([100.0, 0.0], id);
        solver.register_residual_block(cid, cost, Some(HuberLoss::new(1.0)), &[id]).unwrap();
        solver.solve(&mut store, &SolverOptions::default()).unwrap();

        // A plain least-squares fit would land at x = 25.
        assert!(store.get(id).unwrap().values()[0] < 5.0);
    }

    #[test]
    fn test_residual_needs_registered_blocks() {
        let mut solver = LmSolver::new();
        let id = StateBlockId::next();
        let (cid, cost) = fix_2d([0.0, 0.0], id);
        assert!(solver.register_residual_block(cid, cost, None, &[id]).is_err());

        solver.register_parameter_block(id, 2, None).unwrap();
        assert!(solver.register_parameter_block(id, 2, None).is_err());
    }

    #[test]
    fn test_block_count_must_match_cost() {
        let mut solver = LmSolver::new();
        let a = StateBlockId::next();
        let b = StateBlockId::next();
        solver.register_parameter_block(a, 2, None).unwrap();
        solver.register_parameter_block(b, 2, None).unwrap();
        let (cid, cost) = fix_2d([0.0, 0.0], a);

        let err = solver.register_residual_block(cid, cost.clone(), None, &[a, b]).unwrap_err();
        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 1, found: 2, .. }));
        assert!(solver.register_residual_block(cid, cost, None, &[]).is_err());
        assert!(!solver.has_residual_block(cid));
    }
}
