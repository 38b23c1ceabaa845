//! Solver capability: parameter blocks, residual blocks and a blocking solve.

use std::time::Duration;

use serde::Deserialize;

use crate::constraints::{CostFunction, HuberLoss};
use crate::error::Result;
use crate::graph::{ConstraintId, LocalParameterization, StateBlockId, StateBlockStore};

/// Configuration for a solve.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Upper bound on LM iterations (the solver may evaluate more often).
    pub max_iterations: usize,
    /// Relative cost reduction tolerance.
    pub ftol: f64,
    /// Relative parameter change tolerance.
    pub xtol: f64,
    /// Gradient orthogonality tolerance.
    pub gtol: f64,
    /// Huber threshold on whitened residual norms, for constraints applying a loss.
    pub huber_threshold: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            huber_threshold: 5.991_f64.sqrt(), // 95% chi2 with 2 DOF
        }
    }
}

/// Outcome of a solve. A non-converged solve is reported here, never as an error.
#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub converged: bool,
    /// Residual evaluations performed.
    pub iterations: usize,
    /// `½‖r‖²` at the initial values.
    pub initial_cost: f64,
    /// `½‖r‖²` at the returned values.
    pub final_cost: f64,
    pub wall_time: Duration,
    /// Termination reason from the backend.
    pub termination: String,
}

/// A nonlinear least-squares backend.
///
/// State block values are handed over by exclusive reference for the duration
/// of [`Solver::solve`] and written back in place.
pub trait Solver {
    fn register_parameter_block(&mut self, id: StateBlockId, size: usize, local: Option<LocalParameterization>) -> Result<()>;

    fn remove_parameter_block(&mut self, id: StateBlockId) -> Result<()>;

    /// Register a residual on already registered parameter blocks, in signature order.
    fn register_residual_block(
        &mut self,
        id: ConstraintId,
        cost: CostFunction,
        loss: Option<HuberLoss>,
        blocks: &[StateBlockId],
    ) -> Result<()>;

    fn remove_residual_block(&mut self, id: ConstraintId) -> Result<()>;

    fn num_parameter_blocks(&self) -> usize;

    fn num_residual_blocks(&self) -> usize;

    fn solve(&mut self, states: &mut StateBlockStore, options: &SolverOptions) -> Result<SolverSummary>;
}
