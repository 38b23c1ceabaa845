pub mod constraints;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod io;
pub mod motion;
pub mod optimizer;
pub mod system;
pub mod tracking;

pub use error::{EstimationError, Result};
