//! Bridge between the problem's structural notifications and a solver backend.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::constraints::HuberLoss;
use crate::error::Result;
use crate::graph::{ConstraintId, StateBlockId};
use crate::system::Problem;

use super::solver::{Solver, SolverOptions, SolverSummary};

/// Keeps a solver in sync with a problem.
///
/// Every state block is registered at most once, and only active
/// constraints are registered as residual blocks.
pub struct SolverManager {
    solver: Box<dyn Solver>,
    options: SolverOptions,
    blocks: HashSet<StateBlockId>,
    residuals: HashSet<ConstraintId>,
}

impl SolverManager {
    pub fn new(solver: Box<dyn Solver>, options: SolverOptions) -> Self {
        Self {
            solver,
            options,
            blocks: HashSet::new(),
            residuals: HashSet::new(),
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: SolverOptions) {
        self.options = options;
    }

    pub fn is_block_registered(&self, id: StateBlockId) -> bool {
        self.blocks.contains(&id)
    }

    pub fn is_constraint_registered(&self, id: ConstraintId) -> bool {
        self.residuals.contains(&id)
    }

    pub fn num_registered_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_registered_constraints(&self) -> usize {
        self.residuals.len()
    }

    fn register_block(&mut self, problem: &Problem, id: StateBlockId) -> Result<()> {
        if self.blocks.contains(&id) {
            return Ok(());
        }
        let block = problem.state_blocks().get(id)?;
        self.solver
            .register_parameter_block(id, block.size(), block.local_parameterization())?;
        self.blocks.insert(id);
        Ok(())
    }

    /// Apply pending notifications: removals first, then additions.
    pub fn update(&mut self, problem: &mut Problem) -> Result<()> {
        let notes = problem.take_notifications();
        if notes.is_empty() {
            return Ok(());
        }

        for c in &notes.removed_constraints {
            if self.residuals.remove(c) {
                self.solver.remove_residual_block(*c)?;
            }
        }
        for b in &notes.removed_blocks {
            if self.blocks.remove(b) {
                self.solver.remove_parameter_block(*b)?;
            }
        }

        for b in &notes.added_blocks {
            if problem.state_blocks().contains(*b) {
                self.register_block(problem, *b)?;
            }
        }
        for c in &notes.added_constraints {
            if self.residuals.contains(c) {
                continue;
            }
            let Ok(constraint) = problem.constraint(*c) else {
                continue;
            };
            if !constraint.is_active() {
                continue;
            }
            let blocks = constraint.blocks().to_vec();
            for b in &blocks {
                self.register_block(problem, *b)?;
            }
            let constraint = problem.constraint(*c)?;
            let loss = constraint
                .apply_loss
                .then(|| HuberLoss::new(self.options.huber_threshold));
            self.solver
                .register_residual_block(*c, constraint.cost().clone(), loss, &blocks)?;
            self.residuals.insert(*c);
        }
        debug!(
            "[SolverManager] {} parameter blocks, {} residual blocks registered",
            self.blocks.len(),
            self.residuals.len()
        );
        Ok(())
    }

    /// Synchronize, then run one blocking solve on the problem's state blocks.
    pub fn solve(&mut self, problem: &mut Problem) -> Result<SolverSummary> {
        self.update(problem)?;
        let summary = self.solver.solve(problem.state_blocks_mut(), &self.options)?;
        if summary.converged {
            info!(
                "[SolverManager] Converged: cost {:.6e} → {:.6e} in {} evaluations ({:.1}ms)",
                summary.initial_cost,
                summary.final_cost,
                summary.iterations,
                summary.wall_time.as_secs_f64() * 1000.0
            );
        } else {
            warn!(
                "[SolverManager] Not converged ({}): cost {:.6e} → {:.6e}",
                summary.termination, summary.initial_cost, summary.final_cost
            );
        }
        Ok(summary)
    }
}
