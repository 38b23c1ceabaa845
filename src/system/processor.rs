//! Processor capability shared by motion, tracking and fix processors.

use crate::error::Result;
use crate::graph::{CaptureId, FrameId, ProcessorId, SensorId};
use crate::system::Problem;

/// A sensor-bound consumer of captures.
///
/// Processing is synchronous: one capture is fully handled (matching,
/// constraint creation, optional key framing) before the next one is accepted.
pub trait Processor {
    fn name(&self) -> &str;

    /// Sensor whose captures this processor consumes.
    fn sensor(&self) -> SensorId;

    fn id(&self) -> ProcessorId;

    /// Assigned by the estimator at registration; also the arbitration order.
    fn set_id(&mut self, id: ProcessorId);

    /// Handle a capture already registered in the problem.
    ///
    /// Returns the key frame this processor created, if any, so the other
    /// processors can be notified.
    fn process(&mut self, problem: &mut Problem, capture: CaptureId) -> Result<Option<FrameId>>;

    /// Whether this processor wants a key frame now.
    fn vote_for_key_frame(&self, problem: &Problem) -> bool;

    /// Another processor created key frame `frame`.
    fn key_frame_callback(&mut self, problem: &mut Problem, frame: FrameId) -> Result<()>;
}
