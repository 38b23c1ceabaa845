//! Key frame vote criteria for feature trackers.

use serde::Deserialize;

/// Thresholds of the tracker's key frame vote.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyFrameVoteParams {
    /// Minimum captures between key frames.
    pub min_frames: usize,
    /// Always vote once this many captures passed since the last key frame.
    pub max_frames: usize,
    /// Vote when fewer than this fraction of the origin's tracks survive.
    pub min_tracked_ratio: f64,
    /// Vote when fewer tracks than this survive.
    pub min_features_for_keyframe: usize,
    /// Always vote once this many seconds passed since the last key frame.
    pub max_time_span: f64,
}

impl Default for KeyFrameVoteParams {
    fn default() -> Self {
        Self {
            min_frames: 0,
            max_frames: 15,
            min_tracked_ratio: 0.9,
            min_features_for_keyframe: 5,
            max_time_span: f64::INFINITY,
        }
    }
}

/// Decides whether a new key frame should be cut at `last`.
///
/// The criteria mirror common visual odometry practice:
/// - Time and frame count since the last key frame
/// - Fraction of the origin's tracks still alive
/// - Absolute number of surviving tracks
#[derive(Debug, Clone, Default)]
pub struct KeyFrameVote {
    params: KeyFrameVoteParams,
    frames_since_kf: usize,
}

impl KeyFrameVote {
    pub fn new(params: KeyFrameVoteParams) -> Self {
        Self {
            params,
            frames_since_kf: 0,
        }
    }

    pub fn params(&self) -> &KeyFrameVoteParams {
        &self.params
    }

    pub fn frames_since_key_frame(&self) -> usize {
        self.frames_since_kf
    }

    /// Count one processed capture.
    pub fn tick(&mut self) {
        self.frames_since_kf += 1;
    }

    /// Pure predicate over the current tracking quality.
    ///
    /// # Arguments
    /// * `tracked` - Tracks alive in the most recent capture
    /// * `reference` - Tracks alive in the origin capture
    /// * `time_since_kf` - Seconds since the origin key frame
    pub fn vote(&self, tracked: usize, reference: usize, time_since_kf: f64) -> bool {
        // Always vote once the window is too long
        if self.frames_since_kf >= self.params.max_frames || time_since_kf >= self.params.max_time_span {
            return true;
        }

        // Don't vote too soon
        if self.frames_since_kf < self.params.min_frames {
            return false;
        }

        if tracked < self.params.min_features_for_keyframe {
            return true;
        }

        // Vote if tracking quality dropped
        reference > 0 && (tracked as f64 / reference as f64) < self.params.min_tracked_ratio
    }

    /// Reset after key frame creation.
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_on_track_loss() {
        let mut vote = KeyFrameVote::new(KeyFrameVoteParams::default());
        vote.tick();
        assert!(!vote.vote(95, 100, 0.1));
        assert!(vote.vote(80, 100, 0.1));
    }

    #[test]
    fn test_vote_on_scarce_features() {
        let mut vote = KeyFrameVote::new(KeyFrameVoteParams::default());
        vote.tick();
        assert!(vote.vote(4, 4, 0.1));
    }

    #[test]
    fn test_max_frames_forces_vote() {
        let mut vote = KeyFrameVote::new(KeyFrameVoteParams {
            max_frames: 3,
            ..KeyFrameVoteParams::default()
        });
        for _ in 0..3 {
            vote.tick();
        }
        assert!(vote.vote(100, 100, 0.0));

        vote.reset();
        assert_eq!(vote.frames_since_key_frame(), 0);
    }

    #[test]
    fn test_min_frames_holds_vote() {
        let mut vote = KeyFrameVote::new(KeyFrameVoteParams {
            min_frames: 2,
            ..KeyFrameVoteParams::default()
        });
        vote.tick();
        assert!(!vote.vote(0, 100, 0.0));
    }
}
