//! Error taxonomy for the estimation core.
//!
//! Graph-invariant violations and dimension mismatches are programmer errors:
//! they abort the operation that caused them. Solver non-convergence is not an
//! error at all; it is reported through [`crate::optimizer::SolverSummary`].

use thiserror::Error;

/// Errors raised by graph mutation, processing and factory dispatch.
#[derive(Debug, Error)]
pub enum EstimationError {
    /// A graph mutation would break the parent/child invariants.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A capture precedes the last integrated motion sample.
    #[error("non-monotonic time: incoming {incoming} precedes last sample {last}")]
    NonMonotonicTime { last: f64, incoming: f64 },

    /// Sizes of vectors, matrices or bound state blocks disagree with a declared signature.
    #[error("dimension mismatch in {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    /// Factory dispatch on an unregistered type tag.
    #[error("unknown {family} type '{tag}'")]
    UnknownType { family: &'static str, tag: String },

    /// A measurement covariance that is not symmetric positive-definite.
    #[error("invalid covariance: {0}")]
    InvalidCovariance(String),

    /// A value outside the domain of its block, such as a zero-norm quaternion.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The full processing pipeline was invoked on a non-autonomous tracker.
    #[error("processor '{0}' is not autonomous and cannot run process()")]
    NotAutonomous(String),

    /// A handle does not resolve to a live entity.
    #[error("{0} not found")]
    NotFound(String),

    /// A map or configuration description failed validation.
    #[error("malformed map description: {0}")]
    MapFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl EstimationError {
    pub(crate) fn dimension(what: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            found,
        }
    }
}

pub type Result<T> = std::result::Result<T, EstimationError>;
