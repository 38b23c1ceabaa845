//! Top-level estimator: the problem, its processors and the solver bridge.
//!
//! Captures are dispatched synchronously to every processor bound to their
//! sensor, in registration order. A key frame created by one processor is
//! announced to all the others before the next capture is accepted. Solving
//! only happens when the caller asks for it.

use tracing::{debug, info, warn};

use crate::error::{EstimationError, Result};
use crate::graph::{Capture, CaptureData, CaptureId, FrameId, ProcessorId, SensorId};
use crate::optimizer::{LmSolver, Solver, SolverManager, SolverOptions, SolverSummary};

use super::config::EstimatorConfig;
use super::problem::Problem;
use super::processor::Processor;
use super::registry::Registry;

pub struct Estimator {
    problem: Problem,
    processors: Vec<Box<dyn Processor>>,
    solver: SolverManager,
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new(Box::new(LmSolver::new()), SolverOptions::default())
    }
}

impl Estimator {
    pub fn new(solver: Box<dyn Solver>, options: SolverOptions) -> Self {
        Self {
            problem: Problem::new(),
            processors: Vec::new(),
            solver: SolverManager::new(solver, options),
        }
    }

    /// Build sensors and processors from a configuration.
    ///
    /// Entries with an unregistered type tag are skipped and returned; any
    /// other failure aborts construction.
    pub fn from_config(config: &EstimatorConfig, registry: &Registry) -> Result<(Self, Vec<EstimationError>)> {
        let mut estimator = Self::new(Box::new(LmSolver::new()), config.solver.clone());
        let mut skipped = Vec::new();

        for sc in &config.sensors {
            match registry.create_sensor(&mut estimator.problem, sc) {
                Ok(id) => debug!("[Estimator] Sensor '{}' installed as {}", sc.name, id),
                Err(e @ EstimationError::UnknownType { .. }) => {
                    warn!("[Estimator] Skipping sensor '{}': {}", sc.name, e);
                    skipped.push(e);
                }
                Err(e) => return Err(e),
            }
        }

        for pc in &config.processors {
            let Some(sensor) = estimator.problem.sensor_by_name(&pc.sensor) else {
                let e = EstimationError::NotFound(format!("sensor '{}' of processor '{}'", pc.sensor, pc.name));
                warn!("[Estimator] Skipping processor '{}': {}", pc.name, e);
                skipped.push(e);
                continue;
            };
            match registry.create_processor(pc, sensor) {
                Ok(p) => {
                    estimator.add_processor(p);
                }
                Err(e @ EstimationError::UnknownType { .. }) => {
                    warn!("[Estimator] Skipping processor '{}': {}", pc.name, e);
                    skipped.push(e);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "[Estimator] Configured {} sensors, {} processors ({} entries skipped)",
            estimator.problem.sensors().count(),
            estimator.processors.len(),
            skipped.len()
        );
        Ok((estimator, skipped))
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    pub fn problem_mut(&mut self) -> &mut Problem {
        &mut self.problem
    }

    pub fn solver_manager(&self) -> &SolverManager {
        &self.solver
    }

    pub fn processors(&self) -> &[Box<dyn Processor>] {
        &self.processors
    }

    /// Register a processor. Its id is its position, which is also its
    /// priority when several processors ask for the same key frame.
    pub fn add_processor(&mut self, mut processor: Box<dyn Processor>) -> ProcessorId {
        let id = ProcessorId(self.processors.len());
        processor.set_id(id);
        debug!("[Estimator] Processor {} '{}' on sensor {}", id, processor.name(), processor.sensor());
        self.processors.push(processor);
        id
    }

    /// Feed one sensor reading. Each bound processor receives its own capture.
    ///
    /// Returns the key frames created while handling the reading.
    pub fn process(&mut self, sensor: SensorId, timestamp: f64, data: CaptureData) -> Result<Vec<FrameId>> {
        self.problem.sensor(sensor)?;
        let bound: Vec<usize> = self
            .processors
            .iter()
            .enumerate()
            .filter(|(_, p)| p.sensor() == sensor)
            .map(|(i, _)| i)
            .collect();
        if bound.is_empty() {
            warn!("[Estimator] No processor bound to sensor {}, reading at t={:.6} dropped", sensor, timestamp);
            return Ok(Vec::new());
        }

        let mut key_frames = Vec::new();
        for i in bound {
            let capture = self
                .problem
                .add_capture(Capture::new(sensor, timestamp, data.clone()))?;
            let created = match self.processors[i].process(&mut self.problem, capture) {
                Ok(created) => created,
                Err(e) => {
                    self.discard_if_detached(capture)?;
                    return Err(e);
                }
            };
            self.discard_if_detached(capture)?;

            if let Some(kf) = created {
                info!(
                    "[Estimator] Key frame {} at t={:.6} from '{}'",
                    kf,
                    timestamp,
                    self.processors[i].name()
                );
                for (j, other) in self.processors.iter_mut().enumerate() {
                    if j != i {
                        other.key_frame_callback(&mut self.problem, kf)?;
                    }
                }
                key_frames.push(kf);
            }
        }
        Ok(key_frames)
    }

    /// Drop a capture no processor attached to a frame.
    fn discard_if_detached(&mut self, capture: CaptureId) -> Result<()> {
        if self.problem.capture(capture).is_ok() && self.problem.frame_of_capture(capture).is_none() {
            debug!("[Estimator] Capture {} left unattached, removed", capture);
            self.problem.remove_capture(capture)?;
        }
        Ok(())
    }

    /// Synchronize the solver with the problem and run one blocking solve.
    pub fn solve(&mut self) -> Result<SolverSummary> {
        self.solver.solve(&mut self.problem)
    }
}
