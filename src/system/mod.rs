//! Estimator orchestration: the problem graph, processors, factories and configuration.
//!
//! - [`Problem`] owns the graph arenas, sensors and the map, and arbitrates key frames
//! - [`Processor`] is the capability shared by motion, tracking and fix processors
//! - [`Estimator`] dispatches captures to processors and bridges to the solver
//! - [`Registry`] builds typed entities from their type tags

pub mod config;
pub mod estimator;
pub mod fix;
pub mod problem;
pub mod processor;
pub mod registry;

pub use config::{EstimatorConfig, ProcessorConfig, SensorConfig};
pub use estimator::Estimator;
pub use fix::{FixParams, FixProcessor};
pub use problem::{Notifications, Problem};
pub use processor::Processor;
pub use registry::{LandmarkCreator, ProcessorCreator, Registry, SensorCreator};
