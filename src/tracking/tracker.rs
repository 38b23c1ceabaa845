//! Landmark tracker: turns successive image captures into feature tracks and AHP landmarks.
//!
//! # Capture window
//!
//! ```text
//! origin ── last ── incoming
//!   KEY    NON_KEY   (being processed)
//! ```
//!
//! Each `process(incoming)`:
//! 1. Tracks the features alive in `last` into `incoming`
//! 2. Votes for a key frame at `last`
//! 3. On a key frame: establishes constraints for `last`'s tracks, detects
//!    new features, spawns one landmark and one constraint per new feature,
//!    then re-anchors `origin ← last`
//! 4. Otherwise advances: `incoming` replaces `last` inside the same frame

use nalgebra::{DMatrix, DVector, Vector2};
use serde::Deserialize;
use tracing::{debug, info, trace, warn};

use crate::constraints::{CameraModel, ConstraintKind};
use crate::error::{EstimationError, Result};
use crate::geometry::PinholeIntrinsics;
use crate::graph::{
    CaptureId, Feature, FeatureId, FeatureKind, FrameId, FrameKind, FrameStructure, Keypoint,
    LandmarkId, LandmarkKind, LandmarkMatch, ProcessorId, SensorId,
};
use crate::motion::TIME_TOLERANCE;
use crate::system::{Problem, Processor};

use super::active_search::{ActiveSearchGrid, ActiveSearchParams};
use super::detector::{Detector, Roi};
use super::keyframe_vote::{KeyFrameVote, KeyFrameVoteParams};
use super::matcher::Matcher;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// Autonomous trackers create key frames and landmarks on their own.
    pub autonomous: bool,
    /// A match is accepted only above this score.
    pub min_match_score: f64,
    pub max_new_features: usize,
    /// Half-size in pixels of the window searched around a known feature.
    pub search_radius: f64,
    /// Depth assumed for a new landmark, in meters.
    pub initial_depth: f64,
    pub pixel_noise_std: f64,
    pub apply_loss_function: bool,
    pub active_search: ActiveSearchParams,
    pub key_frame: KeyFrameVoteParams,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            autonomous: true,
            min_match_score: 0.8,
            max_new_features: 20,
            search_radius: 20.0,
            initial_depth: 2.0,
            pixel_noise_std: 1.0,
            apply_loss_function: true,
            active_search: ActiveSearchParams::default(),
            key_frame: KeyFrameVoteParams::default(),
        }
    }
}

pub struct TrackerProcessor<D: Detector, M: Matcher> {
    id: ProcessorId,
    name: String,
    sensor: SensorId,
    params: TrackerParams,
    detector: D,
    matcher: M,
    grid: ActiveSearchGrid,
    vote: KeyFrameVote,
    origin: Option<CaptureId>,
    last: Option<CaptureId>,
    incoming: Option<CaptureId>,
}

impl<D: Detector, M: Matcher> TrackerProcessor<D, M> {
    pub fn new(name: impl Into<String>, sensor: SensorId, detector: D, matcher: M, params: TrackerParams) -> Self {
        Self {
            id: ProcessorId(0),
            name: name.into(),
            sensor,
            grid: ActiveSearchGrid::new(params.active_search.clone()),
            vote: KeyFrameVote::new(params.key_frame.clone()),
            params,
            detector,
            matcher,
            origin: None,
            last: None,
            incoming: None,
        }
    }

    pub fn is_autonomous(&self) -> bool {
        self.params.autonomous
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn origin(&self) -> Option<CaptureId> {
        self.origin
    }

    pub fn last(&self) -> Option<CaptureId> {
        self.last
    }

    pub fn incoming(&self) -> Option<CaptureId> {
        self.incoming
    }

    /// Set the capture known features are tracked from. Used by an external
    /// manager driving a non-autonomous tracker.
    pub fn set_last(&mut self, capture: CaptureId) {
        if self.origin.is_none() {
            self.origin = Some(capture);
        }
        self.last = Some(capture);
    }

    pub fn set_incoming(&mut self, capture: CaptureId) {
        self.incoming = Some(capture);
    }

    fn pixel_covariance(&self) -> DMatrix<f64> {
        DMatrix::identity(2, 2) * self.params.pixel_noise_std.powi(2)
    }

    fn camera(&self, problem: &Problem) -> Result<CameraModel> {
        let k = problem
            .sensor_intrinsics(self.sensor)?
            .ok_or_else(|| EstimationError::NotFound(format!("intrinsics of sensor {}", self.sensor)))?;
        let (p, o) = problem.sensor_extrinsics(self.sensor)?;
        if p.len() != 3 || o.len() != 4 {
            return Err(EstimationError::dimension("camera extrinsics", 7, p.len() + o.len()));
        }
        Ok(CameraModel {
            intrinsics: PinholeIntrinsics::from_slice(k.as_slice())?,
            extrinsic_p: [p[0], p[1], p[2]],
            extrinsic_o: [o[0], o[1], o[2], o[3]],
        })
    }

    fn timestamp(problem: &Problem, capture: CaptureId) -> Result<f64> {
        Ok(problem.capture(capture)?.timestamp)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Track every feature alive in `last` into `incoming`.
    ///
    /// Returns the number of accepted matches. Features without a match are
    /// dropped silently; detection failures drop only the feature concerned.
    pub fn process_known_features(&mut self, problem: &mut Problem) -> Result<usize> {
        let last = self
            .last
            .ok_or_else(|| EstimationError::NotFound(format!("last capture of '{}'", self.name)))?;
        let known = problem.features_of(last);
        self.track_features(problem, &known)
    }

    fn track_features(&mut self, problem: &mut Problem, features: &[FeatureId]) -> Result<usize> {
        let incoming = self
            .incoming
            .ok_or_else(|| EstimationError::NotFound(format!("incoming capture of '{}'", self.name)))?;
        let data = problem.capture(incoming)?.data.clone();
        let mut claimed: Vec<Vector2<f64>> = problem
            .features_of(incoming)
            .iter()
            .filter_map(|f| problem.feature(*f).ok().and_then(|f| f.pixel()))
            .collect();

        let mut tracked = 0;
        for fid in features {
            let feature = problem.feature(*fid)?;
            let (Some(pixel), Some(descriptor)) = (feature.pixel(), feature.descriptor.clone()) else {
                continue;
            };
            let track_id = feature.track_id;
            let landmark_match = feature.landmark_match;

            let roi = Roi::around(&pixel, self.params.search_radius);
            let candidates: Vec<Keypoint> = match self.detector.detect(&data, &roi) {
                Ok(kps) => kps.into_iter().filter(|k| !claimed.contains(&k.pixel)).collect(),
                Err(e) => {
                    warn!("[Tracker] '{}' detection failed for track {}: {}", self.name, track_id, e);
                    continue;
                }
            };

            match self.matcher.best_match(&descriptor, &candidates) {
                Some((i, score)) if score > self.params.min_match_score => {
                    let kp = &candidates[i];
                    let mut matched = Feature::new(
                        FeatureKind::PointImage,
                        DVector::from_row_slice(&[kp.pixel.x, kp.pixel.y]),
                        self.pixel_covariance(),
                    )?
                    .with_descriptor(kp.descriptor.clone())
                    .with_track_id(track_id);
                    matched.landmark_match = landmark_match.map(|m| LandmarkMatch {
                        landmark: m.landmark,
                        normalized_score: score,
                    });
                    problem.add_feature(incoming, matched)?;
                    claimed.push(kp.pixel);
                    tracked += 1;
                }
                _ => trace!("[Tracker] '{}' lost track {}", self.name, track_id),
            }
        }
        debug!("[Tracker] '{}' tracked {}/{} features", self.name, tracked, features.len());
        Ok(tracked)
    }

    /// Detect new features in `last` on unexplored grid cells.
    ///
    /// Scans at most `ceil(1.25 × max_new_features)` cells.
    pub fn detect_new_features(&mut self, problem: &mut Problem) -> Result<Vec<FeatureId>> {
        let last = self
            .last
            .ok_or_else(|| EstimationError::NotFound(format!("last capture of '{}'", self.name)))?;
        let data = problem.capture(last)?.data.clone();

        self.grid.renew();
        for f in problem.features_of(last) {
            if let Some(pixel) = problem.feature(f)?.pixel() {
                self.grid.hit_cell(&pixel);
            }
        }

        let max = self.params.max_new_features;
        let budget = (1.25 * max as f64).ceil() as usize;
        let mut created = Vec::new();
        for _ in 0..budget {
            if created.len() >= max {
                break;
            }
            let Some(roi) = self.grid.pick_roi() else {
                break;
            };
            let best = match self.detector.detect(&data, &roi) {
                Ok(kps) => kps.into_iter().next(),
                Err(e) => {
                    warn!("[Tracker] '{}' detection failed in {:?}: {}", self.name, roi, e);
                    None
                }
            };
            match best {
                Some(kp) => {
                    self.grid.hit_cell(&kp.pixel);
                    let feature = Feature::new(
                        FeatureKind::PointImage,
                        DVector::from_row_slice(&[kp.pixel.x, kp.pixel.y]),
                        self.pixel_covariance(),
                    )?
                    .with_descriptor(kp.descriptor);
                    created.push(problem.add_feature(last, feature)?);
                }
                None => self.grid.block_cell(&roi),
            }
        }
        debug!("[Tracker] '{}' detected {} new features", self.name, created.len());
        Ok(created)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmarks & Constraints
    // ─────────────────────────────────────────────────────────────────────────

    /// AHP landmark anchored at `anchor` along the feature's bearing.
    fn create_landmark(&self, problem: &mut Problem, feature: FeatureId, anchor: FrameId, camera: &CameraModel) -> Result<LandmarkId> {
        let f = problem.feature(feature)?;
        let pixel = f
            .pixel()
            .ok_or_else(|| EstimationError::dimension("image feature measurement", 2, f.measurement().len()))?;
        let descriptor = f.descriptor.clone();
        let m = camera.intrinsics.bearing(&pixel);
        let values = DVector::from_row_slice(&[m.x, m.y, m.z, 1.0 / self.params.initial_depth]);

        let landmark = problem.add_landmark(LandmarkKind::Ahp { anchor }, values, descriptor)?;
        problem.feature_mut(feature)?.landmark_match = Some(LandmarkMatch {
            landmark,
            normalized_score: 1.0,
        });
        Ok(landmark)
    }

    /// Image constraint of `feature` in `frame` against its matched landmark.
    fn create_constraint(&self, problem: &mut Problem, feature: FeatureId, frame: FrameId, camera: &CameraModel) -> Result<()> {
        let Some(m) = problem.feature(feature)?.landmark_match else {
            return Ok(());
        };
        let landmark = problem.landmark(m.landmark)?;
        let LandmarkKind::Ahp { anchor } = landmark.kind else {
            return Err(EstimationError::InvalidTopology(format!(
                "landmark {} is not an AHP landmark",
                landmark.id
            )));
        };
        let lmk_block = landmark.position();
        let observer = problem.frame(frame)?;
        let anchor = problem.frame(anchor)?;
        let blocks = [
            observer.position(),
            observer.orientation(),
            anchor.position(),
            anchor.orientation(),
            lmk_block,
        ];
        let id = problem.add_constraint(feature, ConstraintKind::ImageAhp(*camera), &blocks)?;
        problem.constraint_mut(id)?.apply_loss = self.params.apply_loss_function;
        Ok(())
    }

    /// `last` sits in key frame `kf`: constrain its tracks, then spawn new landmarks.
    fn establish_key_frame(&mut self, problem: &mut Problem, kf: FrameId) -> Result<()> {
        let last = self
            .last
            .ok_or_else(|| EstimationError::NotFound(format!("last capture of '{}'", self.name)))?;
        let camera = self.camera(problem)?;

        let tracked = problem.features_of(last);
        for f in &tracked {
            if problem.constraints_of(*f).is_empty() {
                self.create_constraint(problem, *f, kf, &camera)?;
            }
        }

        let new = self.detect_new_features(problem)?;
        for f in &new {
            self.create_landmark(problem, *f, kf, &camera)?;
            self.create_constraint(problem, *f, kf, &camera)?;
        }
        if self.incoming.is_some() && !new.is_empty() {
            self.track_features(problem, &new)?;
        }
        self.vote.reset();
        info!(
            "[Tracker] '{}' key frame {}: {} tracks, {} new landmarks",
            self.name,
            kf,
            tracked.len(),
            new.len()
        );
        Ok(())
    }

    fn init(&mut self, problem: &mut Problem, capture: CaptureId) -> Result<Option<FrameId>> {
        let ts = Self::timestamp(problem, capture)?;
        let (frame, created) = match problem.key_frame_at(ts) {
            Some(f) => (f, false),
            None => {
                problem.permit_key_frame(self.id, ts);
                (problem.create_frame(FrameKind::Key, FrameStructure::Po3D, ts, None)?, true)
            }
        };
        problem.attach_capture(frame, capture)?;
        self.origin = Some(capture);
        self.last = Some(capture);
        self.establish_key_frame(problem, frame)?;
        Ok(created.then_some(frame))
    }

    /// Host `incoming` in a fresh non-key frame predicted at `last`'s state.
    fn new_frame_for_incoming(&self, problem: &mut Problem, last_frame: FrameId, incoming: CaptureId) -> Result<()> {
        let ts = Self::timestamp(problem, incoming)?;
        let structure = problem.frame(last_frame)?.structure;
        let state = problem.frame_state(last_frame)?;
        let frame = problem.create_frame(FrameKind::NonKey, structure, ts, Some(&state))?;
        problem.attach_capture(frame, incoming)
    }
}

impl<D: Detector, M: Matcher> Processor for TrackerProcessor<D, M> {
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
        if !self.params.autonomous {
            return Err(EstimationError::NotAutonomous(self.name.clone()));
        }
        let Some(last) = self.last else {
            return self.init(problem, capture);
        };
        let last_frame = problem
            .frame_of_capture(last)
            .ok_or_else(|| EstimationError::InvalidTopology(format!("last capture {} has no frame", last)))?;

        self.incoming = Some(capture);
        self.vote.tick();
        self.process_known_features(problem)?;

        let mut key_frame = None;
        if self.origin != Some(last) && self.vote_for_key_frame(problem) {
            let last_ts = Self::timestamp(problem, last)?;
            if problem.permit_key_frame(self.id, last_ts) {
                problem.make_key(last_frame)?;
                self.establish_key_frame(problem, last_frame)?;
                self.origin = Some(last);
                key_frame = Some(last_frame);
            } else {
                warn!("[Tracker] '{}' key frame vote at t={:.6} denied", self.name, last_ts);
            }
        }

        if self.origin == Some(last) {
            self.new_frame_for_incoming(problem, last_frame, capture)?;
        } else {
            // advance: incoming replaces last in the same frame
            let ts = Self::timestamp(problem, capture)?;
            problem.attach_capture(last_frame, capture)?;
            problem.remove_capture(last)?;
            problem.set_frame_timestamp(last_frame, ts)?;
        }
        self.last = Some(capture);
        self.incoming = None;
        Ok(key_frame)
    }

    fn vote_for_key_frame(&self, problem: &Problem) -> bool {
        let (Some(origin), Some(last)) = (self.origin, self.last) else {
            return false;
        };
        let head = self.incoming.unwrap_or(last);
        let (Ok(t0), Ok(t1)) = (Self::timestamp(problem, origin), Self::timestamp(problem, head)) else {
            return false;
        };
        let tracked = problem.features_of(head).len();
        let reference = problem.features_of(origin).len();
        self.vote.vote(tracked, reference, t1 - t0)
    }

    fn key_frame_callback(&mut self, problem: &mut Problem, frame: FrameId) -> Result<()> {
        let Some(last) = self.last else {
            return Ok(());
        };
        if self.origin == Some(last) {
            return Ok(());
        }
        let kf_ts = problem.frame(frame)?.timestamp;
        let last_ts = Self::timestamp(problem, last)?;
        if (kf_ts - last_ts).abs() > TIME_TOLERANCE {
            debug!(
                "[Tracker] '{}' key frame {} at t={:.6} does not match last t={:.6}",
                self.name, frame, kf_ts, last_ts
            );
            return Ok(());
        }

        let own = problem.frame_of_capture(last);
        if own != Some(frame) {
            problem.move_capture(last, frame)?;
            if let Some(f) = own {
                if !problem.frame(f)?.is_key() && problem.captures_of(f).is_empty() {
                    problem.remove_frame(f)?;
                }
            }
        }
        self.establish_key_frame(problem, frame)?;
        self.origin = Some(last);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Capture, CaptureData, Descriptor, SensorKind};
    use crate::tracking::{HammingMatcher, PointListDetector};
    use approx::assert_relative_eq;

    const POINTS: [(f64, f64, [u8; 4]); 4] = [
        (40.0, 40.0, [0x00, 0x00, 0x00, 0x00]),
        (200.0, 40.0, [0xFF, 0xFF, 0x00, 0x00]),
        (40.0, 200.0, [0x00, 0x00, 0xFF, 0xFF]),
        (360.0, 300.0, [0xFF, 0xFF, 0xFF, 0xFF]),
    ];

    fn camera_problem() -> (Problem, SensorId) {
        let mut problem = Problem::new();
        let sensor = problem
            .install_sensor(
                "cam",
                SensorKind::Camera,
                &DVector::from_row_slice(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]),
                Some(DVector::from_row_slice(&[320.0, 240.0, 400.0, 400.0])),
            )
            .unwrap();
        (problem, sensor)
    }

    fn image(problem: &mut Problem, sensor: SensorId, ts: f64, shift: f64, count: usize) -> CaptureId {
        let kps = POINTS[..count]
            .iter()
            .map(|(x, y, d)| Keypoint {
                pixel: Vector2::new(x + shift, y + shift),
                descriptor: Descriptor(d.to_vec()),
            })
            .collect();
        problem
            .add_capture(Capture::new(sensor, ts, CaptureData::Keypoints(kps)))
            .unwrap()
    }

    fn tracker(sensor: SensorId, params: TrackerParams) -> TrackerProcessor<PointListDetector, HammingMatcher> {
        TrackerProcessor::new("tracker", sensor, PointListDetector, HammingMatcher, params)
    }

    /// Every cell of the 4×3 grid fits in the scan budget, so detection
    /// finds all points whatever cells the picker draws first.
    fn quiet_params() -> TrackerParams {
        TrackerParams {
            max_new_features: 10,
            active_search: ActiveSearchParams {
                cells_h: 4,
                cells_v: 3,
                ..ActiveSearchParams::default()
            },
            key_frame: KeyFrameVoteParams {
                max_frames: 100,
                min_tracked_ratio: 0.5,
                min_features_for_keyframe: 0,
                ..KeyFrameVoteParams::default()
            },
            ..TrackerParams::default()
        }
    }

    #[test]
    fn test_first_capture_spawns_landmarks() {
        let (mut problem, sensor) = camera_problem();
        let mut t = tracker(sensor, quiet_params());
        let c = image(&mut problem, sensor, 0.0, 0.0, 4);

        let kf = t.process(&mut problem, c).unwrap().unwrap();

        assert!(problem.frame(kf).unwrap().is_key());
        assert_eq!(problem.landmarks().count(), 4);
        assert_eq!(problem.constraints().count(), 4);
        for f in problem.features_of(c) {
            assert!(problem.feature(f).unwrap().landmark_match.is_some());
        }
        problem.check_invariants().unwrap();
    }

    #[test]
    fn test_tracks_advance_within_one_frame() {
        let (mut problem, sensor) = camera_problem();
        let mut t = tracker(sensor, quiet_params());
        let c0 = image(&mut problem, sensor, 0.0, 0.0, 4);
        t.process(&mut problem, c0).unwrap();
        let origin_tracks: Vec<u64> = problem
            .features_of(c0)
            .iter()
            .map(|f| problem.feature(*f).unwrap().track_id)
            .collect();

        let c1 = image(&mut problem, sensor, 0.1, 1.0, 4);
        assert!(t.process(&mut problem, c1).unwrap().is_none());
        let frame = problem.frame_of_capture(c1).unwrap();

        let c2 = image(&mut problem, sensor, 0.2, 2.0, 4);
        assert!(t.process(&mut problem, c2).unwrap().is_none());

        assert_eq!(problem.frame_of_capture(c2), Some(frame));
        assert!(problem.capture(c1).is_err());
        assert_relative_eq!(problem.frame(frame).unwrap().timestamp, 0.2);
        let tracks: Vec<u64> = problem
            .features_of(c2)
            .iter()
            .map(|f| problem.feature(*f).unwrap().track_id)
            .collect();
        assert_eq!(tracks, origin_tracks);
        problem.check_invariants().unwrap();
    }

    #[test]
    fn test_track_loss_cuts_key_frame_at_last() {
        let (mut problem, sensor) = camera_problem();
        let mut t = tracker(sensor, quiet_params());
        let c0 = image(&mut problem, sensor, 0.0, 0.0, 4);
        let kf0 = t.process(&mut problem, c0).unwrap().unwrap();
        let c1 = image(&mut problem, sensor, 0.1, 1.0, 4);
        t.process(&mut problem, c1).unwrap();
        let f1 = problem.frame_of_capture(c1).unwrap();

        let c2 = image(&mut problem, sensor, 0.2, 2.0, 1);
        let kf1 = t.process(&mut problem, c2).unwrap();

        assert_eq!(kf1, Some(f1));
        assert_eq!(problem.key_frames(), vec![kf0, f1]);
        assert_eq!(t.origin(), Some(c1));
        assert_eq!(t.last(), Some(c2));
        assert_ne!(problem.frame_of_capture(c2), Some(f1));
        // four tracks re-observed at the new key frame
        assert_eq!(problem.constraints().count(), 8);
        problem.check_invariants().unwrap();
    }

    #[test]
    fn test_low_score_is_rejected() {
        let (mut problem, sensor) = camera_problem();
        let mut t = tracker(sensor, quiet_params());
        let c0 = image(&mut problem, sensor, 0.0, 0.0, 1);
        t.process(&mut problem, c0).unwrap();

        let c1 = problem
            .add_capture(Capture::new(
                sensor,
                0.1,
                CaptureData::Keypoints(vec![Keypoint {
                    pixel: Vector2::new(41.0, 41.0),
                    descriptor: Descriptor(vec![0xFF, 0x00, 0x00, 0x00]),
                }]),
            ))
            .unwrap();
        t.process(&mut problem, c1).unwrap();

        assert!(problem.features_of(c1).is_empty());
    }

    #[test]
    fn test_non_autonomous_tracker_only_matches() {
        let (mut problem, sensor) = camera_problem();
        let mut t = tracker(
            sensor,
            TrackerParams {
                autonomous: false,
                ..quiet_params()
            },
        );
        let c0 = image(&mut problem, sensor, 0.0, 0.0, 4);
        let c1 = image(&mut problem, sensor, 0.1, 1.0, 4);

        let err = t.process(&mut problem, c0).unwrap_err();
        assert!(matches!(err, EstimationError::NotAutonomous(_)));

        t.set_last(c0);
        assert_eq!(t.detect_new_features(&mut problem).unwrap().len(), 4);
        t.set_incoming(c1);
        assert_eq!(t.process_known_features(&mut problem).unwrap(), 4);
        assert_eq!(problem.landmarks().count(), 0);
        assert!(problem.key_frames().is_empty());
    }
}
