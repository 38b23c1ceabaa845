//! Motion processor: integrates a stream of motion captures between key frames.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ──first capture──▶ Integrating ──┐
//!                                      ▲          │ capture: integrate, move "last"
//!                                      └──────────┘ key frame: freeze delta, re-anchor
//! ```
//!
//! The origin is the last key frame this processor integrates from. The open
//! buffer belongs to the processor; it is handed to a capture once a key
//! frame closes it, together with the motion feature and its constraint.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{EstimationError, Result};
use crate::graph::{
    Capture, CaptureData, CaptureId, Feature, FeatureKind, FrameId, FrameKind, ProcessorId,
    SensorId, StateBlockId,
};
use crate::system::{Problem, Processor};

use super::buffer::{MotionBuffer, TIME_TOLERANCE};
use super::model::MotionModel;

/// Motion processor tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionParams {
    /// Vote for a key frame once the buffer spans this many seconds.
    pub max_time_span: f64,
    /// Vote for a key frame once this many steps are integrated.
    pub max_buffer_length: usize,
    /// Added to the diagonal of a frozen delta covariance so it stays positive-definite.
    pub covariance_floor: f64,
    /// Fix the first key frame this processor creates (gauge prior).
    pub fix_first_frame: bool,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            max_time_span: 1.0,
            max_buffer_length: 10,
            covariance_floor: 1e-9,
            fix_first_frame: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Uninitialized,
    Integrating,
}

#[derive(Debug, Clone, Copy)]
struct Last {
    frame: FrameId,
    capture: CaptureId,
}

pub struct MotionProcessor<M: MotionModel> {
    id: ProcessorId,
    name: String,
    sensor: SensorId,
    model: M,
    params: MotionParams,
    state: MotionState,
    origin: Option<FrameId>,
    last: Option<Last>,
    buffer: Option<MotionBuffer>,
    /// Key frames announced ahead of the buffer, joined once odometry reaches them.
    pending: Vec<FrameId>,
}

impl<M: MotionModel> MotionProcessor<M> {
    pub fn new(name: impl Into<String>, sensor: SensorId, model: M, params: MotionParams) -> Self {
        Self {
            id: ProcessorId(0),
            name: name.into(),
            sensor,
            model,
            params,
            state: MotionState::Uninitialized,
            origin: None,
            last: None,
            buffer: None,
            pending: Vec::new(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn params(&self) -> &MotionParams {
        &self.params
    }

    pub fn motion_state(&self) -> MotionState {
        self.state
    }

    /// The open buffer, integrated since the origin key frame.
    pub fn buffer(&self) -> Option<&MotionBuffer> {
        self.buffer.as_ref()
    }

    pub fn origin_frame(&self) -> Option<FrameId> {
        self.origin
    }

    /// Frame hosting the most recent capture, if it is not the origin.
    pub fn last_frame(&self) -> Option<FrameId> {
        self.last.map(|l| l.frame)
    }

    fn open_buffer(&self) -> Result<&MotionBuffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| EstimationError::NotFound(format!("motion buffer of '{}'", self.name)))
    }

    fn origin_state(&self, problem: &Problem) -> Result<DVector<f64>> {
        let origin = self
            .origin
            .ok_or_else(|| EstimationError::NotFound(format!("origin of '{}'", self.name)))?;
        problem.frame_state(origin)
    }

    /// Predicted state at the most recent integrated timestamp.
    pub fn state(&self, problem: &Problem) -> Result<DVector<f64>> {
        let x0 = self.origin_state(problem)?;
        Ok(self.model.x_plus_delta(&x0, &self.open_buffer()?.last().delta_integr))
    }

    /// Predicted state at `ts`, interpolated within the open buffer.
    ///
    /// Timestamps outside the buffer clamp to its ends.
    pub fn state_at(&self, problem: &Problem, ts: f64) -> Result<DVector<f64>> {
        let x0 = self.origin_state(problem)?;
        let (delta, _) = self.open_buffer()?.delta_at(&self.model, ts);
        Ok(self.model.x_plus_delta(&x0, &delta))
    }

    /// Delta `d` with `delta(t1) ⊕ d = delta(t2)`, both read from the open buffer.
    pub fn delta_between(&self, t1: f64, t2: f64) -> Result<DVector<f64>> {
        let buffer = self.open_buffer()?;
        let (d1, _) = buffer.delta_at(&self.model, t1);
        let (d2, _) = buffer.delta_at(&self.model, t2);
        Ok(self.model.delta_minus_delta(&d1, &d2))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Processing
    // ─────────────────────────────────────────────────────────────────────────

    fn motion_data(&self, problem: &Problem, capture: CaptureId) -> Result<(f64, DVector<f64>, DMatrix<f64>)> {
        let cap = problem.capture(capture)?;
        match &cap.data {
            CaptureData::Motion { data, covariance } => {
                if data.len() != self.model.data_size() {
                    return Err(EstimationError::dimension(
                        format!("{} data", self.model.name()),
                        self.model.data_size(),
                        data.len(),
                    ));
                }
                Ok((cap.timestamp, data.clone(), covariance.clone()))
            }
            _ => Err(EstimationError::InvalidTopology(format!(
                "capture {} carries no motion data",
                capture
            ))),
        }
    }

    fn initialize(&mut self, problem: &mut Problem, capture: CaptureId, ts: f64) -> Result<Option<FrameId>> {
        let (frame, created) = match problem.key_frame_at(ts) {
            Some(f) => (f, false),
            None => {
                problem.permit_key_frame(self.id, ts);
                let f = problem.create_frame(FrameKind::Key, self.model.frame_structure(), ts, None)?;
                if self.params.fix_first_frame {
                    problem.fix_frame(f, true)?;
                }
                (f, true)
            }
        };
        problem.attach_capture(frame, capture)?;

        let buffer = MotionBuffer::new(ts, &self.model);
        problem.capture_mut(capture)?.buffer = Some(buffer.clone());
        self.buffer = Some(buffer);
        self.origin = Some(frame);
        self.last = None;
        self.state = MotionState::Integrating;
        info!("[MotionProcessor] '{}' initialized at t={:.6} on frame {}", self.name, ts, frame);
        Ok(created.then_some(frame))
    }

    fn integrate(&mut self, problem: &mut Problem, capture: CaptureId) -> Result<Option<FrameId>> {
        let (ts, data, data_cov) = self.motion_data(problem, capture)?;
        let last_ts = self.open_buffer()?.last().ts;
        if ts < last_ts - TIME_TOLERANCE {
            return Err(EstimationError::NonMonotonicTime { last: last_ts, incoming: ts });
        }
        let dt = (ts - last_ts).max(0.0);
        let data_cov = if data_cov.is_empty() {
            self.model.default_data_covariance(&data, dt)
        } else {
            data_cov
        };
        let (delta, delta_cov) = self.model.data_to_delta(&data, &data_cov, dt)?;

        let buffer = self
            .buffer
            .as_mut()
            .ok_or_else(|| EstimationError::NotFound(format!("motion buffer of '{}'", self.name)))?;
        buffer.integrate(&self.model, ts, delta, delta_cov);

        let predicted = self.state(problem)?;
        match self.last {
            None => {
                let frame = problem.create_frame(FrameKind::NonKey, self.model.frame_structure(), ts, Some(&predicted))?;
                problem.attach_capture(frame, capture)?;
                self.last = Some(Last { frame, capture });
            }
            Some(last) => {
                problem.attach_capture(last.frame, capture)?;
                problem.remove_capture(last.capture)?;
                problem.set_frame_timestamp(last.frame, ts)?;
                problem.set_frame_state(last.frame, &predicted)?;
                self.last = Some(Last {
                    frame: last.frame,
                    capture,
                });
            }
        }
        debug!(
            "[MotionProcessor] '{}' integrated t={:.6} (dt={:.4}, {} samples)",
            self.name,
            ts,
            dt,
            self.open_buffer()?.len()
        );
        self.close_pending(problem, ts)?;

        if self.vote_for_key_frame(problem) {
            if problem.permit_key_frame(self.id, ts) {
                if let Some(last) = self.last {
                    problem.make_key(last.frame)?;
                    self.close_at(problem, last.frame)?;
                    info!("[MotionProcessor] '{}' created key frame {} at t={:.6}", self.name, last.frame, ts);
                    return Ok(Some(last.frame));
                }
            } else if let Some(kf) = problem.key_frame_at(ts).filter(|kf| Some(*kf) != self.origin) {
                debug!("[MotionProcessor] '{}' joining existing key frame {} at t={:.6}", self.name, kf, ts);
                self.close_at(problem, kf)?;
            } else {
                warn!("[MotionProcessor] '{}' key frame vote at t={:.6} denied", self.name, ts);
            }
        }
        Ok(None)
    }

    /// Close the buffer at every pending key frame the buffer now reaches, oldest first.
    fn close_pending(&mut self, problem: &mut Problem, ts: f64) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let origin_ts = match self.origin {
            Some(origin) => problem.frame(origin)?.timestamp,
            None => return Ok(()),
        };
        let mut due = Vec::new();
        let mut waiting = Vec::new();
        for kf in self.pending.drain(..) {
            match problem.frame(kf) {
                Ok(frame) if frame.timestamp <= origin_ts + TIME_TOLERANCE => {
                    debug!("[MotionProcessor] '{}' pending key frame {} overtaken by origin", self.name, kf)
                }
                Ok(frame) if frame.timestamp <= ts + TIME_TOLERANCE => due.push((frame.timestamp, kf)),
                Ok(_) => waiting.push(kf),
                Err(_) => debug!("[MotionProcessor] '{}' pending key frame {} removed", self.name, kf),
            }
        }
        self.pending = waiting;
        due.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, kf) in due {
            self.close_at(problem, kf)?;
        }
        Ok(())
    }

    /// Cut the open buffer at key frame `kf`, freeze the closed part into a
    /// motion constraint and re-anchor the origin at `kf`.
    fn close_at(&mut self, problem: &mut Problem, kf: FrameId) -> Result<()> {
        let origin = self
            .origin
            .ok_or_else(|| EstimationError::NotFound(format!("origin of '{}'", self.name)))?;
        let frame = problem.frame(kf)?;
        if frame.structure != self.model.frame_structure() {
            return Err(EstimationError::dimension(
                format!("key frame state for {}", self.model.name()),
                self.model.state_size(),
                frame.structure.state_size(),
            ));
        }
        let kf_ts = frame.timestamp;
        let x0 = problem.frame_state(origin)?;

        let buffer = self
            .buffer
            .as_mut()
            .ok_or_else(|| EstimationError::NotFound(format!("motion buffer of '{}'", self.name)))?;
        let closed = buffer.split(&self.model, kf_ts);
        let remainder_empty = buffer.len() == 1;
        let delta = closed.last().delta_integr.clone();
        let n = closed.last().delta_integr_cov.nrows();
        let cov = &closed.last().delta_integr_cov + DMatrix::identity(n, n) * self.params.covariance_floor;

        // The last capture lands exactly on the key frame: it becomes the closing capture.
        let capture = match self.last {
            Some(last) if remainder_empty => {
                if last.frame != kf {
                    problem.move_capture(last.capture, kf)?;
                    problem.remove_frame(last.frame)?;
                }
                self.last = None;
                last.capture
            }
            _ => {
                let c = problem.add_capture(Capture::new(self.sensor, kf_ts, CaptureData::Empty))?;
                problem.attach_capture(kf, c)?;
                c
            }
        };
        problem.capture_mut(capture)?.buffer = Some(closed);

        let feature = problem.add_feature(capture, Feature::new(FeatureKind::Motion, delta.clone(), cov)?)?;
        let blocks: Vec<StateBlockId> = problem
            .frame(origin)?
            .state_blocks()
            .iter()
            .chain(problem.frame(kf)?.state_blocks())
            .copied()
            .collect();
        problem.add_constraint(feature, self.model.constraint_kind(), &blocks)?;

        let predicted = self.model.x_plus_delta(&x0, &delta);
        problem.set_frame_state(kf, &predicted)?;
        self.origin = Some(kf);

        if let Some(last) = self.last {
            let x = self.state(problem)?;
            problem.set_frame_state(last.frame, &x)?;
        }
        debug!(
            "[MotionProcessor] '{}' froze delta {} → {} at t={:.6}",
            self.name, origin, kf, kf_ts
        );
        Ok(())
    }
}

impl<M: MotionModel> Processor for MotionProcessor<M> {
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
        if let Some(calibration) = problem.sensor_intrinsics(self.sensor)? {
            self.model.set_calibration(&calibration);
        }
        match self.state {
            MotionState::Uninitialized => {
                let ts = problem.capture(capture)?.timestamp;
                self.initialize(problem, capture, ts)
            }
            MotionState::Integrating => self.integrate(problem, capture),
        }
    }

    fn vote_for_key_frame(&self, _problem: &Problem) -> bool {
        match &self.buffer {
            Some(b) => b.time_span() >= self.params.max_time_span || b.len() > self.params.max_buffer_length,
            None => false,
        }
    }

    fn key_frame_callback(&mut self, problem: &mut Problem, frame: FrameId) -> Result<()> {
        let (Some(origin), Some(buffer)) = (self.origin, self.buffer.as_ref()) else {
            debug!("[MotionProcessor] '{}' not initialized, ignoring key frame {}", self.name, frame);
            return Ok(());
        };
        let kf_ts = problem.frame(frame)?.timestamp;
        let origin_ts = problem.frame(origin)?.timestamp;
        if kf_ts <= origin_ts + TIME_TOLERANCE {
            warn!(
                "[MotionProcessor] '{}' key frame {} at t={:.6} not after origin t={:.6}, ignored",
                self.name, frame, kf_ts, origin_ts
            );
            return Ok(());
        }
        if kf_ts > buffer.last().ts + TIME_TOLERANCE {
            debug!(
                "[MotionProcessor] '{}' key frame {} at t={:.6} ahead of buffer end t={:.6}, pending",
                self.name,
                frame,
                kf_ts,
                buffer.last().ts
            );
            if !self.pending.contains(&frame) {
                self.pending.push(frame);
            }
            return Ok(());
        }
        self.close_at(problem, frame)
    }
}
