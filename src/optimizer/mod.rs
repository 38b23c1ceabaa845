//! Optimization backend.
//!
//! Implements the solver side of the estimator:
//! - The [`Solver`] capability (parameter blocks, residual blocks, solve)
//! - A Levenberg–Marquardt backend over whitened constraint residuals
//! - The [`SolverManager`] bridging problem notifications to the solver

pub mod lm;
pub mod manager;
pub mod solver;

pub use lm::LmSolver;
pub use manager::SolverManager;
pub use solver::{Solver, SolverOptions, SolverSummary};
