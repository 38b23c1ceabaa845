//! Feature tracking: turns image captures into tracks, landmarks and image constraints.
//!
//! This module implements the visual front-end of the estimator:
//! - Detector and matcher capabilities (keypoints, descriptors, scores)
//! - Active search over an image grid
//! - Key frame voting
//! - The tracker processor state machine

pub mod active_search;
pub mod detector;
pub mod keyframe_vote;
pub mod matcher;
pub mod tracker;

pub use active_search::{ActiveSearchGrid, ActiveSearchParams, CellState};
pub use detector::{Detector, PointListDetector, Roi};
pub use keyframe_vote::{KeyFrameVote, KeyFrameVoteParams};
pub use matcher::{HammingMatcher, Matcher};
pub use tracker::{TrackerParams, TrackerProcessor};
