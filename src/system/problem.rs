//! Problem - the estimation graph and its arenas.
//!
//! The Problem owns every entity: frames, captures, features, constraints,
//! landmarks, sensors and state blocks. Entities refer to each other through
//! typed handles; ownership is recorded in a [`NodeTree`] rooted at the
//! problem, with three fixed branches:
//!
//! - Trajectory: Frames → Captures → Features → Constraints
//! - Map: Landmarks
//! - Hardware: Sensors
//!
//! Removing any node removes its subtree, the state blocks it owns and every
//! constraint elsewhere that binds one of those blocks. Structural changes
//! relevant to the solver are queued as [`Notifications`].

use std::collections::{HashMap, HashSet};

use nalgebra::DVector;
use tracing::{debug, trace};

use crate::constraints::{Constraint, ConstraintKind, ConstraintStatus};
use crate::error::{EstimationError, Result};
use crate::graph::{
    Capture, CaptureId, ConstraintId, Descriptor, Feature, FeatureId, Frame, FrameId, FrameKind,
    FrameStructure, Landmark, LandmarkId, LandmarkKind, NodeId, NodeKind, NodeTree, ProcessorId,
    Sensor, SensorId, SensorKind, StateBlock, StateBlockId, StateBlockStore, StateOwner,
};
use crate::motion::TIME_TOLERANCE;

/// Structural changes since the solver last synchronized.
#[derive(Debug, Default, Clone)]
pub struct Notifications {
    pub added_blocks: Vec<StateBlockId>,
    pub removed_blocks: Vec<StateBlockId>,
    pub added_constraints: Vec<ConstraintId>,
    pub removed_constraints: Vec<ConstraintId>,
}

impl Notifications {
    pub fn is_empty(&self) -> bool {
        self.added_blocks.is_empty()
            && self.removed_blocks.is_empty()
            && self.added_constraints.is_empty()
            && self.removed_constraints.is_empty()
    }
}

/// The estimation graph.
pub struct Problem {
    tree: NodeTree,
    root: NodeId,
    trajectory: NodeId,
    map: NodeId,
    hardware: NodeId,

    state_blocks: StateBlockStore,
    frames: HashMap<FrameId, Frame>,
    captures: HashMap<CaptureId, Capture>,
    features: HashMap<FeatureId, Feature>,
    constraints: HashMap<ConstraintId, Constraint>,
    landmarks: HashMap<LandmarkId, Landmark>,
    sensors: HashMap<SensorId, Sensor>,

    /// Key frame grants: timestamp → processor that owns it.
    key_frame_grants: Vec<(f64, ProcessorId)>,

    notifications: Notifications,
}

impl Default for Problem {
    fn default() -> Self {
        Self::new()
    }
}

impl Problem {
    /// Create an empty problem with its three top-level branches.
    pub fn new() -> Self {
        let mut tree = NodeTree::new();
        let root = NodeId::next();
        let trajectory = NodeId::next();
        let map = NodeId::next();
        let hardware = NodeId::next();

        // Fresh ids in an empty tree: these links cannot fail.
        let _ = tree.insert(root, NodeKind::Problem, "problem");
        let _ = tree.insert(trajectory, NodeKind::Trajectory, "trajectory");
        let _ = tree.insert(map, NodeKind::Map, "map");
        let _ = tree.insert(hardware, NodeKind::Hardware, "hardware");
        let _ = tree.add_child(root, trajectory);
        let _ = tree.add_child(root, map);
        let _ = tree.add_child(root, hardware);

        Self {
            tree,
            root,
            trajectory,
            map,
            hardware,
            state_blocks: StateBlockStore::new(),
            frames: HashMap::new(),
            captures: HashMap::new(),
            features: HashMap::new(),
            constraints: HashMap::new(),
            landmarks: HashMap::new(),
            sensors: HashMap::new(),
            key_frame_grants: Vec::new(),
            notifications: Notifications::default(),
        }
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State Blocks
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state_blocks(&self) -> &StateBlockStore {
        &self.state_blocks
    }

    /// Exclusive access for the solver during one solve.
    pub fn state_blocks_mut(&mut self) -> &mut StateBlockStore {
        &mut self.state_blocks
    }

    pub fn block_values(&self, id: StateBlockId) -> Result<&DVector<f64>> {
        Ok(self.state_blocks.get(id)?.values())
    }

    pub fn set_block_values(&mut self, id: StateBlockId, values: &[f64]) -> Result<()> {
        self.state_blocks.get_mut(id)?.set_values(values)
    }

    pub fn set_block_fixed(&mut self, id: StateBlockId, fixed: bool) -> Result<()> {
        self.state_blocks.get_mut(id)?.set_fixed(fixed);
        Ok(())
    }

    /// Build a block without storing it, so a failure leaves nothing behind.
    fn build_block(owner: StateOwner, values: DVector<f64>, quaternion: bool, fixed: bool) -> Result<StateBlock> {
        let id = StateBlockId::next();
        if quaternion {
            StateBlock::quaternion(id, owner, values, fixed)
        } else {
            Ok(StateBlock::new(id, owner, values, fixed))
        }
    }

    fn insert_block(&mut self, block: StateBlock) -> StateBlockId {
        let id = block.id;
        self.state_blocks.insert(block);
        self.notifications.added_blocks.push(id);
        id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sensors
    // ─────────────────────────────────────────────────────────────────────────

    /// Install a sensor under Hardware.
    ///
    /// `extrinsics` is the sensor pose in the robot frame: `[x, y, θ]` for
    /// planar sensors, `[x, y, z, qx, qy, qz, qw]` for spatial ones. Extrinsic
    /// and intrinsic blocks start fixed.
    pub fn install_sensor(
        &mut self,
        name: &str,
        kind: SensorKind,
        extrinsics: &DVector<f64>,
        intrinsics: Option<DVector<f64>>,
    ) -> Result<SensorId> {
        let (np, no) = kind.extrinsic_sizes();
        if extrinsics.len() != np + no {
            return Err(EstimationError::dimension(
                format!("{} extrinsics", kind.type_name()),
                np + no,
                extrinsics.len(),
            ));
        }
        let id = SensorId::next();
        let owner = StateOwner::Sensor(id);
        let extrinsic_p = Self::build_block(owner, extrinsics.rows(0, np).into_owned(), false, true)?;
        let extrinsic_o = Self::build_block(owner, extrinsics.rows(np, no).into_owned(), no == 4, true)?;
        let intrinsic = match intrinsics {
            Some(k) => Some(Self::build_block(owner, k, false, true)?),
            None => None,
        };
        let extrinsic_p = self.insert_block(extrinsic_p);
        let extrinsic_o = self.insert_block(extrinsic_o);
        let intrinsic = intrinsic.map(|b| self.insert_block(b));

        self.tree.insert(id.node(), NodeKind::Sensor, name)?;
        self.tree.add_child(self.hardware, id.node())?;
        self.sensors.insert(
            id,
            Sensor {
                id,
                name: name.to_string(),
                kind,
                extrinsic_p,
                extrinsic_o,
                intrinsic,
            },
        );
        debug!("[Problem] Installed sensor {} '{}' ({})", id, name, kind.type_name());
        Ok(id)
    }

    pub fn sensor(&self, id: SensorId) -> Result<&Sensor> {
        self.sensors
            .get(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("sensor {}", id)))
    }

    pub fn sensor_by_name(&self, name: &str) -> Option<SensorId> {
        self.sensors.values().find(|s| s.name == name).map(|s| s.id)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    /// Current values of the sensor's intrinsic block, if it has one.
    pub fn sensor_intrinsics(&self, id: SensorId) -> Result<Option<DVector<f64>>> {
        match self.sensor(id)?.intrinsic {
            Some(b) => Ok(Some(self.block_values(b)?.clone())),
            None => Ok(None),
        }
    }

    /// Extrinsic position and orientation values of a sensor.
    pub fn sensor_extrinsics(&self, id: SensorId) -> Result<(DVector<f64>, DVector<f64>)> {
        let s = self.sensor(id)?;
        Ok((
            self.block_values(s.extrinsic_p)?.clone(),
            self.block_values(s.extrinsic_o)?.clone(),
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frames
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a frame under Trajectory. `state` defaults to the identity state.
    pub fn create_frame(
        &mut self,
        kind: FrameKind,
        structure: FrameStructure,
        timestamp: f64,
        state: Option<&DVector<f64>>,
    ) -> Result<FrameId> {
        let state = match state {
            Some(s) => {
                structure.check(s)?;
                s.clone()
            }
            None => structure.zero_state(),
        };

        let id = FrameId::next();
        let owner = StateOwner::Frame(id);
        let mut built = Vec::with_capacity(3);
        let mut offset = 0;
        for (i, size) in structure.block_sizes().iter().enumerate() {
            let values = state.rows(offset, *size).into_owned();
            let is_quat = i == 1 && structure.is_3d();
            built.push(Self::build_block(owner, values, is_quat, false)?);
            offset += size;
        }
        let blocks: Vec<StateBlockId> = built.into_iter().map(|b| self.insert_block(b)).collect();

        self.tree.insert(id.node(), NodeKind::Frame, format!("frame@{:.6}", timestamp))?;
        self.tree.add_child(self.trajectory, id.node())?;
        self.frames.insert(
            id,
            Frame {
                id,
                timestamp,
                kind,
                structure,
                blocks,
            },
        );
        if kind == FrameKind::Key {
            self.release_grants_up_to(timestamp);
        }
        trace!("[Problem] Created {:?} frame {} at t={:.6}", kind, id, timestamp);
        Ok(id)
    }

    pub fn frame(&self, id: FrameId) -> Result<&Frame> {
        self.frames
            .get(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("frame {}", id)))
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.values()
    }

    /// Concatenated state of a frame in layout order.
    pub fn frame_state(&self, id: FrameId) -> Result<DVector<f64>> {
        let frame = self.frame(id)?;
        let mut out = Vec::with_capacity(frame.structure.state_size());
        for b in frame.state_blocks() {
            out.extend(self.block_values(*b)?.iter());
        }
        Ok(DVector::from_vec(out))
    }

    pub fn set_frame_state(&mut self, id: FrameId, state: &DVector<f64>) -> Result<()> {
        let frame = self.frame(id)?;
        frame.structure.check(state)?;
        let blocks = frame.blocks.clone();
        let sizes = frame.structure.block_sizes();
        let mut offset = 0;
        for (b, size) in blocks.iter().zip(sizes) {
            self.state_blocks
                .get_mut(*b)?
                .set_values(&state.as_slice()[offset..offset + size])?;
            offset += size;
        }
        Ok(())
    }

    pub fn set_frame_timestamp(&mut self, id: FrameId, timestamp: f64) -> Result<()> {
        self.frames
            .get_mut(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("frame {}", id)))?
            .timestamp = timestamp;
        Ok(())
    }

    /// Promote a frame to KEY.
    pub fn make_key(&mut self, id: FrameId) -> Result<()> {
        let frame = self
            .frames
            .get_mut(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("frame {}", id)))?;
        if frame.kind != FrameKind::Key {
            frame.kind = FrameKind::Key;
            debug!("[Problem] Frame {} at t={:.6} is now KEY", id, frame.timestamp);
        }
        let timestamp = frame.timestamp;
        self.release_grants_up_to(timestamp);
        Ok(())
    }

    /// Fix or release all state blocks of a frame.
    pub fn fix_frame(&mut self, id: FrameId, fixed: bool) -> Result<()> {
        let blocks = self.frame(id)?.blocks.clone();
        for b in blocks {
            self.set_block_fixed(b, fixed)?;
        }
        Ok(())
    }

    /// KEY frames ordered by timestamp.
    pub fn key_frames(&self) -> Vec<FrameId> {
        let mut kfs: Vec<&Frame> = self.frames.values().filter(|f| f.is_key()).collect();
        kfs.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        kfs.into_iter().map(|f| f.id).collect()
    }

    pub fn last_key_frame(&self) -> Option<FrameId> {
        self.frames
            .values()
            .filter(|f| f.is_key())
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
            .map(|f| f.id)
    }

    pub fn key_frame_at(&self, timestamp: f64) -> Option<FrameId> {
        self.frames
            .values()
            .find(|f| f.is_key() && (f.timestamp - timestamp).abs() <= TIME_TOLERANCE)
            .map(|f| f.id)
    }

    pub fn remove_frame(&mut self, id: FrameId) -> Result<()> {
        self.frame(id)?;
        self.remove_node(id.node())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Captures
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a capture. It stays detached until attached to a frame.
    pub fn add_capture(&mut self, capture: Capture) -> Result<CaptureId> {
        self.sensor(capture.sensor)?;
        let id = capture.id;
        self.tree.insert(id.node(), NodeKind::Capture, format!("capture@{:.6}", capture.timestamp))?;
        self.captures.insert(id, capture);
        Ok(id)
    }

    pub fn capture(&self, id: CaptureId) -> Result<&Capture> {
        self.captures
            .get(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("capture {}", id)))
    }

    pub fn capture_mut(&mut self, id: CaptureId) -> Result<&mut Capture> {
        self.captures
            .get_mut(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("capture {}", id)))
    }

    pub fn attach_capture(&mut self, frame: FrameId, capture: CaptureId) -> Result<()> {
        self.frame(frame)?;
        self.capture(capture)?;
        self.tree.add_child(frame.node(), capture.node())
    }

    /// Move a capture (with its features) to another frame.
    pub fn move_capture(&mut self, capture: CaptureId, frame: FrameId) -> Result<()> {
        self.frame(frame)?;
        self.tree.detach(capture.node())?;
        self.tree.add_child(frame.node(), capture.node())
    }

    pub fn remove_capture(&mut self, id: CaptureId) -> Result<()> {
        self.capture(id)?;
        self.remove_node(id.node())
    }

    pub fn frame_of_capture(&self, id: CaptureId) -> Option<FrameId> {
        self.tree
            .parent(id.node())
            .map(FrameId)
            .filter(|f| self.frames.contains_key(f))
    }

    pub fn captures_of(&self, frame: FrameId) -> Vec<CaptureId> {
        self.tree
            .children(frame.node())
            .iter()
            .map(|n| CaptureId(*n))
            .collect()
    }

    /// Capture of `sensor` in `frame`, if any.
    pub fn capture_of_sensor(&self, frame: FrameId, sensor: SensorId) -> Option<CaptureId> {
        self.captures_of(frame)
            .into_iter()
            .find(|c| self.captures.get(c).map(|c| c.sensor) == Some(sensor))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Features
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_feature(&mut self, capture: CaptureId, feature: Feature) -> Result<FeatureId> {
        self.capture(capture)?;
        let id = feature.id;
        self.tree.insert(id.node(), NodeKind::Feature, format!("{:?}", feature.kind))?;
        self.tree.add_child(capture.node(), id.node())?;
        self.features.insert(id, feature);
        Ok(id)
    }

    pub fn feature(&self, id: FeatureId) -> Result<&Feature> {
        self.features
            .get(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("feature {}", id)))
    }

    pub fn feature_mut(&mut self, id: FeatureId) -> Result<&mut Feature> {
        self.features
            .get_mut(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("feature {}", id)))
    }

    pub fn features_of(&self, capture: CaptureId) -> Vec<FeatureId> {
        self.tree
            .children(capture.node())
            .iter()
            .map(|n| FeatureId(*n))
            .collect()
    }

    pub fn capture_of_feature(&self, id: FeatureId) -> Option<CaptureId> {
        self.tree.parent(id.node()).map(CaptureId)
    }

    pub fn frame_of_feature(&self, id: FeatureId) -> Option<FrameId> {
        self.capture_of_feature(id).and_then(|c| self.frame_of_capture(c))
    }

    pub fn remove_feature(&mut self, id: FeatureId) -> Result<()> {
        self.feature(id)?;
        self.remove_node(id.node())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Constraints
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a constraint of `kind` on `feature`, binding `blocks` in order.
    ///
    /// The signature is checked before anything is registered: on error the
    /// problem is left untouched.
    pub fn add_constraint(
        &mut self,
        feature: FeatureId,
        kind: ConstraintKind,
        blocks: &[StateBlockId],
    ) -> Result<ConstraintId> {
        let f = self.feature(feature)?;
        let mut sized = Vec::with_capacity(blocks.len());
        for b in blocks {
            sized.push((*b, self.state_blocks.get(*b)?.size()));
        }
        let constraint = Constraint::new(kind, f, &sized)?;
        let id = constraint.id;

        self.tree.insert(id.node(), NodeKind::Constraint, constraint.kind().type_name())?;
        self.tree.add_child(feature.node(), id.node())?;
        self.constraints.insert(id, constraint);
        self.notifications.added_constraints.push(id);
        trace!("[Problem] Added constraint {} on feature {}", id, feature);
        Ok(id)
    }

    pub fn constraint(&self, id: ConstraintId) -> Result<&Constraint> {
        self.constraints
            .get(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("constraint {}", id)))
    }

    pub fn constraint_mut(&mut self, id: ConstraintId) -> Result<&mut Constraint> {
        self.constraints
            .get_mut(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("constraint {}", id)))
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.values()
    }

    pub fn constraints_of(&self, feature: FeatureId) -> Vec<ConstraintId> {
        self.tree
            .children(feature.node())
            .iter()
            .map(|n| ConstraintId(*n))
            .collect()
    }

    /// Constraints binding any block of the given frame.
    pub fn constraints_on_frame(&self, frame: FrameId) -> Result<Vec<ConstraintId>> {
        let blocks: HashSet<StateBlockId> = self.frame(frame)?.state_blocks().iter().copied().collect();
        Ok(self
            .constraints
            .values()
            .filter(|c| c.blocks().iter().any(|b| blocks.contains(b)))
            .map(|c| c.id)
            .collect())
    }

    /// Activate or deactivate a constraint; the solver sees it as removed or added.
    pub fn set_constraint_status(&mut self, id: ConstraintId, status: ConstraintStatus) -> Result<()> {
        let c = self.constraint_mut(id)?;
        if c.status == status {
            return Ok(());
        }
        c.status = status;
        match status {
            ConstraintStatus::Active => self.notifications.added_constraints.push(id),
            ConstraintStatus::Inactive => self.notifications.removed_constraints.push(id),
        }
        Ok(())
    }

    pub fn remove_constraint(&mut self, id: ConstraintId) -> Result<()> {
        self.constraint(id)?;
        self.remove_node(id.node())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmarks
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a landmark under Map.
    pub fn add_landmark(
        &mut self,
        kind: LandmarkKind,
        values: DVector<f64>,
        descriptor: Option<Descriptor>,
    ) -> Result<LandmarkId> {
        if values.len() != kind.state_size() {
            return Err(EstimationError::dimension(
                format!("{} landmark", kind.type_name()),
                kind.state_size(),
                values.len(),
            ));
        }
        if let LandmarkKind::Ahp { anchor } = kind {
            let frame = self.frame(anchor)?;
            if !frame.structure.is_3d() {
                return Err(EstimationError::InvalidTopology(format!(
                    "AHP anchor {} is not a 3D frame",
                    anchor
                )));
            }
        }
        let id = LandmarkId::next();
        let position = Self::build_block(StateOwner::Landmark(id), values, false, false)?;
        let position = self.insert_block(position);
        self.tree.insert(id.node(), NodeKind::Landmark, kind.type_name())?;
        self.tree.add_child(self.map, id.node())?;
        self.landmarks.insert(
            id,
            Landmark {
                id,
                kind,
                position,
                descriptor,
            },
        );
        trace!("[Problem] Added landmark {} ({})", id, kind.type_name());
        Ok(id)
    }

    pub fn landmark(&self, id: LandmarkId) -> Result<&Landmark> {
        self.landmarks
            .get(&id)
            .ok_or_else(|| EstimationError::NotFound(format!("landmark {}", id)))
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn landmark_values(&self, id: LandmarkId) -> Result<&DVector<f64>> {
        self.block_values(self.landmark(id)?.position)
    }

    pub fn remove_landmark(&mut self, id: LandmarkId) -> Result<()> {
        self.landmark(id)?;
        self.remove_node(id.node())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Key Frame Arbitration
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask for the right to create a key frame at `timestamp`.
    ///
    /// The first processor to ask for a timestamp wins; later requests from
    /// other processors for the same timestamp are refused.
    pub fn permit_key_frame(&mut self, processor: ProcessorId, timestamp: f64) -> bool {
        if let Some((_, owner)) = self
            .key_frame_grants
            .iter()
            .find(|(t, _)| (t - timestamp).abs() <= TIME_TOLERANCE)
        {
            let granted = *owner == processor;
            debug!(
                "[Problem] Key frame at t={:.6} already granted to {}; {} {}",
                timestamp,
                owner,
                processor,
                if granted { "re-granted" } else { "refused" }
            );
            return granted;
        }
        if self.key_frame_at(timestamp).is_some() {
            debug!("[Problem] Key frame at t={:.6} already exists; {} refused", timestamp, processor);
            return false;
        }
        self.key_frame_grants.push((timestamp, processor));
        true
    }

    /// Grants at or before an existing key frame are settled: the key frame
    /// itself refuses later requests at its timestamp.
    fn release_grants_up_to(&mut self, timestamp: f64) {
        self.key_frame_grants.retain(|(t, _)| *t > timestamp + TIME_TOLERANCE);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    pub fn take_notifications(&mut self) -> Notifications {
        std::mem::take(&mut self.notifications)
    }

    pub fn pending_notifications(&self) -> &Notifications {
        &self.notifications
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────

    fn remove_node(&mut self, node: NodeId) -> Result<()> {
        let removed = self.tree.remove_subtree(node)?;
        let mut dead_blocks = Vec::new();
        let mut orphaned_landmarks = Vec::new();
        for id in removed {
            self.forget(id, &mut dead_blocks, &mut orphaned_landmarks);
        }
        self.drop_blocks(dead_blocks)?;
        for l in orphaned_landmarks {
            if self.landmarks.contains_key(&l) {
                debug!("[Problem] Removing landmark {} with its anchor", l);
                self.remove_node(l.node())?;
            }
        }
        Ok(())
    }

    /// Drop the arena entry of a removed tree node.
    fn forget(&mut self, id: NodeId, dead_blocks: &mut Vec<StateBlockId>, orphaned: &mut Vec<LandmarkId>) {
        if self.constraints.remove(&ConstraintId(id)).is_some() {
            self.notifications.removed_constraints.push(ConstraintId(id));
            return;
        }
        if self.features.remove(&FeatureId(id)).is_some() || self.captures.remove(&CaptureId(id)).is_some() {
            return;
        }
        if let Some(frame) = self.frames.remove(&FrameId(id)) {
            dead_blocks.extend(frame.blocks);
            orphaned.extend(
                self.landmarks
                    .values()
                    .filter(|l| l.kind == LandmarkKind::Ahp { anchor: frame.id })
                    .map(|l| l.id),
            );
            self.key_frame_grants
                .retain(|(t, _)| (t - frame.timestamp).abs() > TIME_TOLERANCE);
        } else if let Some(landmark) = self.landmarks.remove(&LandmarkId(id)) {
            dead_blocks.push(landmark.position);
            for f in self.features.values_mut() {
                if f.landmark_match.map(|m| m.landmark) == Some(landmark.id) {
                    f.landmark_match = None;
                }
            }
        } else if let Some(sensor) = self.sensors.remove(&SensorId(id)) {
            dead_blocks.extend(sensor.state_blocks());
        }
    }

    /// Remove state blocks and every constraint still binding one of them.
    fn drop_blocks(&mut self, dead: Vec<StateBlockId>) -> Result<()> {
        if dead.is_empty() {
            return Ok(());
        }
        let dead_set: HashSet<StateBlockId> = dead.iter().copied().collect();
        let dependents: Vec<ConstraintId> = self
            .constraints
            .values()
            .filter(|c| c.blocks().iter().any(|b| dead_set.contains(b)))
            .map(|c| c.id)
            .collect();
        for c in dependents {
            let removed = self.tree.remove_subtree(c.node())?;
            for id in removed {
                if self.constraints.remove(&ConstraintId(id)).is_some() {
                    self.notifications.removed_constraints.push(ConstraintId(id));
                }
            }
        }
        for b in dead {
            if self.state_blocks.remove(b).is_some() {
                self.notifications.removed_blocks.push(b);
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invariants
    // ─────────────────────────────────────────────────────────────────────────

    /// Check tree consistency and that every constraint binds live blocks.
    pub fn check_invariants(&self) -> Result<()> {
        self.tree.check_invariants()?;
        for c in self.constraints.values() {
            if self.tree.parent(c.id.node()) != Some(c.feature.node()) {
                return Err(EstimationError::InvalidTopology(format!(
                    "constraint {} not owned by its feature {}",
                    c.id, c.feature
                )));
            }
            for b in c.blocks() {
                if !self.state_blocks.contains(*b) {
                    return Err(EstimationError::InvalidTopology(format!(
                        "constraint {} binds dead block {}",
                        c.id, b
                    )));
                }
            }
        }
        for f in self.frames.values() {
            if self.tree.parent(f.id.node()) != Some(self.trajectory) {
                return Err(EstimationError::InvalidTopology(format!("frame {} outside trajectory", f.id)));
            }
        }
        for l in self.landmarks.values() {
            if self.tree.parent(l.id.node()) != Some(self.map) {
                return Err(EstimationError::InvalidTopology(format!("landmark {} outside map", l.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CaptureData, FeatureKind};
    use nalgebra::DMatrix;

    fn with_gps() -> (Problem, SensorId) {
        let mut p = Problem::new();
        let s = p
            .install_sensor("gps", SensorKind::GpsFix, &DVector::zeros(3), None)
            .unwrap();
        (p, s)
    }

    fn fix_on(p: &mut Problem, sensor: SensorId, frame: FrameId) -> (CaptureId, FeatureId, ConstraintId) {
        let cap = p
            .add_capture(Capture::new(sensor, 0.0, CaptureData::Empty))
            .unwrap();
        p.attach_capture(frame, cap).unwrap();
        let feat = p
            .add_feature(
                cap,
                Feature::new(FeatureKind::Fix, DVector::from_row_slice(&[5.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
            )
            .unwrap();
        let pos = p.frame(frame).unwrap().position();
        let c = p.add_constraint(feat, ConstraintKind::Fix2D, &[pos]).unwrap();
        (cap, feat, c)
    }

    #[test]
    fn test_create_frame_splits_state() {
        let mut p = Problem::new();
        let state = DVector::from_row_slice(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 2.0]);
        let f = p.create_frame(FrameKind::Key, FrameStructure::Po3D, 0.5, Some(&state)).unwrap();

        let out = p.frame_state(f).unwrap();
        assert_eq!(out.len(), 7);
        assert_eq!(out[6], 1.0);
        assert_eq!(p.key_frames(), vec![f]);
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_create_frame_rejects_wrong_state() {
        let mut p = Problem::new();
        let err = p
            .create_frame(FrameKind::Key, FrameStructure::Po2D, 0.0, Some(&DVector::zeros(7)))
            .unwrap_err();

        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 3, found: 7, .. }));
        assert_eq!(p.frames().count(), 0);
    }

    #[test]
    fn test_zero_quaternion_leaves_no_blocks() {
        let mut p = Problem::new();
        p.take_notifications();
        let blocks_before = p.state_blocks().len();
        let state = DVector::from_row_slice(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0]);

        let err = p
            .create_frame(FrameKind::Key, FrameStructure::Po3D, 0.0, Some(&state))
            .unwrap_err();

        assert!(matches!(err, EstimationError::InvalidValue(_)));
        assert_eq!(p.frames().count(), 0);
        assert_eq!(p.state_blocks().len(), blocks_before);
        assert!(p.pending_notifications().added_blocks.is_empty());

        let extrinsics = DVector::from_row_slice(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let err = p
            .install_sensor("odom", SensorKind::Odom3D, &extrinsics, None)
            .unwrap_err();
        assert!(matches!(err, EstimationError::InvalidValue(_)));
        assert_eq!(p.state_blocks().len(), blocks_before);
        assert!(p.pending_notifications().added_blocks.is_empty());
    }

    #[test]
    fn test_constraint_ownership_chain() {
        let (mut p, s) = with_gps();
        let f = p.create_frame(FrameKind::Key, FrameStructure::Po2D, 0.0, None).unwrap();
        let (cap, feat, c) = fix_on(&mut p, s, f);

        assert_eq!(p.frame_of_capture(cap), Some(f));
        assert_eq!(p.frame_of_feature(feat), Some(f));
        assert_eq!(p.constraints_of(feat), vec![c]);
        assert_eq!(p.constraints_on_frame(f).unwrap(), vec![c]);
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_failed_constraint_registers_nothing() {
        let (mut p, s) = with_gps();
        let f = p.create_frame(FrameKind::Key, FrameStructure::Po3D, 0.0, None).unwrap();
        let cap = p.add_capture(Capture::new(s, 0.0, CaptureData::Empty)).unwrap();
        p.attach_capture(f, cap).unwrap();
        let feat = p
            .add_feature(cap, Feature::new(FeatureKind::Fix, DVector::zeros(2), DMatrix::identity(2, 2)).unwrap())
            .unwrap();
        p.take_notifications();

        // 3D position block bound where a 2D one is expected.
        let pos = p.frame(f).unwrap().position();
        let err = p.add_constraint(feat, ConstraintKind::Fix2D, &[pos]).unwrap_err();

        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 2, found: 3, .. }));
        assert_eq!(p.constraints().count(), 0);
        assert!(p.constraints_of(feat).is_empty());
        assert!(p.pending_notifications().is_empty());
    }

    #[test]
    fn test_remove_frame_cascades() {
        let (mut p, s) = with_gps();
        let f = p.create_frame(FrameKind::Key, FrameStructure::Po2D, 0.0, None).unwrap();
        let (cap, feat, c) = fix_on(&mut p, s, f);
        let blocks = p.frame(f).unwrap().state_blocks().to_vec();
        p.take_notifications();

        p.remove_frame(f).unwrap();

        assert!(p.capture(cap).is_err());
        assert!(p.feature(feat).is_err());
        assert!(p.constraint(c).is_err());
        for b in &blocks {
            assert!(!p.state_blocks().contains(*b));
        }
        let n = p.take_notifications();
        assert_eq!(n.removed_constraints, vec![c]);
        assert_eq!(n.removed_blocks.len(), 2);
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_landmark_drops_dependent_constraints() {
        let mut p = Problem::new();
        let cam = p
            .install_sensor(
                "cam",
                SensorKind::Camera,
                &DVector::from_row_slice(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]),
                Some(DVector::from_row_slice(&[320.0, 240.0, 400.0, 400.0])),
            )
            .unwrap();
        let f = p.create_frame(FrameKind::Key, FrameStructure::Po3D, 0.0, None).unwrap();
        let l = p
            .add_landmark(
                LandmarkKind::Ahp { anchor: f },
                DVector::from_row_slice(&[0.0, 0.0, 1.0, 0.5]),
                None,
            )
            .unwrap();
        let cap = p.add_capture(Capture::new(cam, 0.0, CaptureData::Empty)).unwrap();
        p.attach_capture(f, cap).unwrap();
        let mut feature =
            Feature::new(FeatureKind::PointImage, DVector::from_row_slice(&[320.0, 240.0]), DMatrix::identity(2, 2)).unwrap();
        feature.landmark_match = Some(crate::graph::LandmarkMatch {
            landmark: l,
            normalized_score: 1.0,
        });
        let feat = p.add_feature(cap, feature).unwrap();
        let frame = p.frame(f).unwrap().clone();
        let blocks = [
            frame.position(),
            frame.orientation(),
            frame.position(),
            frame.orientation(),
            p.landmark(l).unwrap().position(),
        ];
        let kind = ConstraintKind::ImageAhp(crate::constraints::CameraModel {
            intrinsics: crate::geometry::PinholeIntrinsics::new(320.0, 240.0, 400.0, 400.0),
            extrinsic_p: [0.0; 3],
            extrinsic_o: [0.0, 0.0, 0.0, 1.0],
        });
        let c = p.add_constraint(feat, kind, &blocks).unwrap();

        p.remove_landmark(l).unwrap();

        assert!(p.constraint(c).is_err());
        assert!(p.feature(feat).unwrap().landmark_match.is_none());
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_removing_anchor_removes_ahp_landmark() {
        let mut p = Problem::new();
        let f = p.create_frame(FrameKind::Key, FrameStructure::Po3D, 0.0, None).unwrap();
        let l = p
            .add_landmark(LandmarkKind::Ahp { anchor: f }, DVector::from_row_slice(&[0.0, 0.0, 1.0, 1.0]), None)
            .unwrap();

        p.remove_frame(f).unwrap();
        assert!(p.landmark(l).is_err());
    }

    #[test]
    fn test_move_capture_between_frames() {
        let (mut p, s) = with_gps();
        let f1 = p.create_frame(FrameKind::NonKey, FrameStructure::Po2D, 0.0, None).unwrap();
        let f2 = p.create_frame(FrameKind::NonKey, FrameStructure::Po2D, 0.1, None).unwrap();
        let cap = p.add_capture(Capture::new(s, 0.0, CaptureData::Empty)).unwrap();
        p.attach_capture(f1, cap).unwrap();

        assert!(p.attach_capture(f2, cap).is_err());
        p.move_capture(cap, f2).unwrap();

        assert!(p.captures_of(f1).is_empty());
        assert_eq!(p.frame_of_capture(cap), Some(f2));
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_key_frame_arbitration_first_wins() {
        let mut p = Problem::new();
        let a = ProcessorId(0);
        let b = ProcessorId(1);

        assert!(p.permit_key_frame(b, 1.0));
        assert!(!p.permit_key_frame(a, 1.0));
        assert!(p.permit_key_frame(b, 1.0));
        assert!(p.permit_key_frame(a, 2.0));
    }

    #[test]
    fn test_grants_released_by_key_frame() {
        let mut p = Problem::new();
        let a = ProcessorId(0);
        for k in 1..=3 {
            assert!(p.permit_key_frame(a, k as f64));
        }
        assert!(p.permit_key_frame(a, 5.0));
        assert_eq!(p.key_frame_grants.len(), 4);

        p.create_frame(FrameKind::Key, FrameStructure::Po2D, 3.0, None).unwrap();
        assert_eq!(p.key_frame_grants.len(), 1);
        assert!(!p.permit_key_frame(ProcessorId(1), 3.0));

        let f = p.create_frame(FrameKind::NonKey, FrameStructure::Po2D, 5.0, None).unwrap();
        assert_eq!(p.key_frame_grants.len(), 1);
        p.make_key(f).unwrap();
        assert!(p.key_frame_grants.is_empty());
    }

    #[test]
    fn test_sensor_extrinsics_size_checked() {
        let mut p = Problem::new();
        let err = p
            .install_sensor("odo", SensorKind::Odom3D, &DVector::zeros(3), None)
            .unwrap_err();
        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 7, .. }));
    }
}
