//! Absolute position fixes (GPS-like) turned into frame priors.
//!
//! Every fix lands on a key frame at its timestamp: an existing one if
//! another processor already cut it, a new planar key frame otherwise.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::constraints::ConstraintKind;
use crate::error::{EstimationError, Result};
use crate::graph::{
    CaptureData, CaptureId, Feature, FeatureKind, FrameId, FrameKind, FrameStructure, ProcessorId,
    SensorId,
};

use super::problem::Problem;
use super::processor::Processor;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FixParams {
    /// Standard deviation (m) assumed for fixes delivered without a covariance.
    pub default_std: f64,
}

impl Default for FixParams {
    fn default() -> Self {
        Self { default_std: 1.0 }
    }
}

pub struct FixProcessor {
    id: ProcessorId,
    name: String,
    sensor: SensorId,
    params: FixParams,
}

impl FixProcessor {
    pub fn new(name: impl Into<String>, sensor: SensorId, params: FixParams) -> Self {
        Self {
            id: ProcessorId(0),
            name: name.into(),
            sensor,
            params,
        }
    }

    pub fn params(&self) -> &FixParams {
        &self.params
    }

    fn measurement(&self, data: &CaptureData) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let CaptureData::Fix { position, covariance } = data else {
            return Err(EstimationError::InvalidTopology(format!(
                "'{}' expects fix captures",
                self.name
            )));
        };
        if position.len() != 2 {
            return Err(EstimationError::dimension("position fix", 2, position.len()));
        }
        let cov = if covariance.is_empty() {
            DMatrix::identity(2, 2) * (self.params.default_std * self.params.default_std)
        } else {
            covariance.clone()
        };
        Ok((position.clone(), cov))
    }
}

impl Processor for FixProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn sensor(&self) -> SensorId {
        self.sensor
    }

    fn id(&self) -> ProcessorId {
        self.id
    }

    fn set_id(&mut self, id: ProcessorId) {
        self.id = id;
    }

    fn process(&mut self, problem: &mut Problem, capture: CaptureId) -> Result<Option<FrameId>> {
        let (ts, (position, cov)) = {
            let cap = problem.capture(capture)?;
            (cap.timestamp, self.measurement(&cap.data)?)
        };
        // Validate before touching the graph.
        let feature = Feature::new(FeatureKind::Fix, position.clone(), cov)?;

        let (frame, created) = match problem.key_frame_at(ts) {
            Some(kf) => (kf, false),
            None => {
                if !problem.permit_key_frame(self.id, ts) {
                    warn!("[FixProcessor] '{}' key frame at t={:.6} denied, fix dropped", self.name, ts);
                    return Ok(None);
                }
                let state = DVector::from_row_slice(&[position[0], position[1], 0.0]);
                let kf = problem.create_frame(FrameKind::Key, FrameStructure::Po2D, ts, Some(&state))?;
                (kf, true)
            }
        };
        let structure = problem.frame(frame)?.structure;
        if structure != FrameStructure::Po2D {
            return Err(EstimationError::InvalidTopology(format!(
                "'{}' cannot fix non-planar frame {}",
                self.name, frame
            )));
        }

        problem.attach_capture(frame, capture)?;
        let feature = problem.add_feature(capture, feature)?;
        let pos = problem.frame(frame)?.position();
        problem.add_constraint(feature, ConstraintKind::Fix2D, &[pos])?;
        debug!(
            "[FixProcessor] '{}' fix ({:.3}, {:.3}) on {} at t={:.6}",
            self.name, position[0], position[1], frame, ts
        );
        Ok(created.then_some(frame))
    }

    fn vote_for_key_frame(&self, _problem: &Problem) -> bool {
        true
    }

    fn key_frame_callback(&mut self, _problem: &mut Problem, _frame: FrameId) -> Result<()> {
        Ok(())
    }
}
