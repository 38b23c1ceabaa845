//! Map persistence as YAML.
//!
//! ```yaml
//! nlandmarks: 2
//! landmarks:
//!   - type: POINT 2D
//!     position: [1.0, 2.0]
//!   - type: AHP
//!     anchor_ts: 0.5
//!     parameters: [0.0, 0.0, 1.0, 0.5]
//!     descriptor: [255, 0, 17, 4]
//! ```
//!
//! The whole description is validated before any landmark is built. Entries
//! are constructed through the registry, keyed by their `type` tag; AHP
//! anchors are resolved to the key frame at `anchor_ts`.

use std::path::Path;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EstimationError, Result};
use crate::graph::{Descriptor, LandmarkId, LandmarkKind};
use crate::system::{Problem, Registry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDescription {
    pub nlandmarks: usize,
    #[serde(default)]
    pub landmarks: Vec<serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PointEntry {
    #[serde(rename = "type")]
    kind: String,
    position: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    descriptor: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AhpEntry {
    #[serde(rename = "type")]
    kind: String,
    anchor_ts: f64,
    parameters: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    descriptor: Option<Vec<u8>>,
}

fn entry_type(entry: &serde_yaml::Value, index: usize) -> Result<&str> {
    entry
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| EstimationError::MapFormat(format!("landmark entry {} has no string 'type'", index)))
}

/// Check counts and tags without constructing anything.
pub fn validate(map: &MapDescription) -> Result<()> {
    if map.landmarks.len() != map.nlandmarks {
        return Err(EstimationError::MapFormat(format!(
            "nlandmarks is {} but {} entries are given",
            map.nlandmarks,
            map.landmarks.len()
        )));
    }
    for (i, entry) in map.landmarks.iter().enumerate() {
        entry_type(entry, i)?;
    }
    Ok(())
}

/// Load landmarks into `problem`. Entries with an unregistered type are
/// skipped; the ids of the created landmarks are returned in file order.
///
/// Loading is all or nothing: if any entry fails to build, the landmarks
/// already created from this description are removed again.
pub fn load_map_str(problem: &mut Problem, registry: &Registry, text: &str) -> Result<Vec<LandmarkId>> {
    let map: MapDescription = serde_yaml::from_str(text)?;
    validate(&map)?;

    let mut created = Vec::with_capacity(map.nlandmarks);
    for (i, entry) in map.landmarks.iter().enumerate() {
        let tag = entry_type(entry, i)?;
        match registry.create_landmark(problem, tag, entry) {
            Ok(id) => created.push(id),
            Err(e @ EstimationError::UnknownType { .. }) => {
                warn!("[Map] Skipping landmark entry {}: {}", i, e);
            }
            Err(e) => {
                warn!(
                    "[Map] Landmark entry {} failed ({}), discarding {} loaded landmarks",
                    i,
                    e,
                    created.len()
                );
                for id in created {
                    problem.remove_landmark(id)?;
                }
                return Err(e);
            }
        }
    }
    info!("[Map] Loaded {} of {} landmarks", created.len(), map.nlandmarks);
    Ok(created)
}

pub fn load_map_file(problem: &mut Problem, registry: &Registry, path: impl AsRef<Path>) -> Result<Vec<LandmarkId>> {
    let text = std::fs::read_to_string(path)?;
    load_map_str(problem, registry, &text)
}

/// Serialize every landmark of the problem, in creation order.
pub fn save_map_str(problem: &Problem) -> Result<String> {
    let mut landmarks: Vec<_> = problem.landmarks().collect();
    landmarks.sort_by_key(|l| l.id);

    let mut entries = Vec::with_capacity(landmarks.len());
    for lmk in landmarks {
        let values = problem.landmark_values(lmk.id)?.as_slice().to_vec();
        let descriptor = lmk.descriptor.as_ref().map(|d| d.0.clone());
        let kind = lmk.kind.type_name().to_string();
        let entry = match lmk.kind {
            LandmarkKind::Point2D | LandmarkKind::Point3D => serde_yaml::to_value(PointEntry {
                kind,
                position: values,
                descriptor,
            })?,
            LandmarkKind::Ahp { anchor } => serde_yaml::to_value(AhpEntry {
                kind,
                anchor_ts: problem.frame(anchor)?.timestamp,
                parameters: values,
                descriptor,
            })?,
        };
        entries.push(entry);
    }
    let map = MapDescription {
        nlandmarks: entries.len(),
        landmarks: entries,
    };
    Ok(serde_yaml::to_string(&map)?)
}

pub fn save_map_file(problem: &Problem, path: impl AsRef<Path>) -> Result<()> {
    std::fs::write(path, save_map_str(problem)?)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry creators
// ─────────────────────────────────────────────────────────────────────────────

fn point(problem: &mut Problem, kind: LandmarkKind, value: &serde_yaml::Value) -> Result<LandmarkId> {
    let entry: PointEntry = serde_yaml::from_value(value.clone())?;
    problem.add_landmark(kind, DVector::from_vec(entry.position), entry.descriptor.map(Descriptor))
}

pub fn point_2d_from_yaml(problem: &mut Problem, value: &serde_yaml::Value) -> Result<LandmarkId> {
    point(problem, LandmarkKind::Point2D, value)
}

pub fn point_3d_from_yaml(problem: &mut Problem, value: &serde_yaml::Value) -> Result<LandmarkId> {
    point(problem, LandmarkKind::Point3D, value)
}

pub fn ahp_from_yaml(problem: &mut Problem, value: &serde_yaml::Value) -> Result<LandmarkId> {
    let entry: AhpEntry = serde_yaml::from_value(value.clone())?;
    let anchor = problem
        .key_frame_at(entry.anchor_ts)
        .ok_or_else(|| EstimationError::NotFound(format!("AHP anchor key frame at t={}", entry.anchor_ts)))?;
    problem.add_landmark(
        LandmarkKind::Ahp { anchor },
        DVector::from_vec(entry.parameters),
        entry.descriptor.map(Descriptor),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FrameKind, FrameStructure};
    use approx::assert_relative_eq;

    fn problem_with_anchor(ts: f64) -> Problem {
        let mut problem = Problem::new();
        problem
            .create_frame(FrameKind::Key, FrameStructure::Po3D, ts, None)
            .unwrap();
        problem
    }

    #[test]
    fn test_count_mismatch_builds_nothing() {
        let text = r#"
nlandmarks: 3
landmarks:
  - type: POINT 2D
    position: [1.0, 2.0]
  - type: POINT 3D
    position: [1.0, 2.0, 3.0]
"#;
        let mut problem = Problem::new();
        let err = load_map_str(&mut problem, &Registry::with_defaults(), text).unwrap_err();

        assert!(matches!(err, EstimationError::MapFormat(_)));
        assert_eq!(problem.landmarks().count(), 0);
    }

    #[test]
    fn test_missing_type_fails_validation() {
        let text = r#"
nlandmarks: 2
landmarks:
  - type: POINT 2D
    position: [1.0, 2.0]
  - position: [3.0, 4.0]
"#;
        let mut problem = Problem::new();
        let err = load_map_str(&mut problem, &Registry::with_defaults(), text).unwrap_err();

        assert!(matches!(err, EstimationError::MapFormat(_)));
        assert_eq!(problem.landmarks().count(), 0);
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let text = r#"
nlandmarks: 2
landmarks:
  - type: LINE 2D
    endpoints: [0, 0, 1, 1]
  - type: POINT 2D
    position: [3, 4]
"#;
        let mut problem = Problem::new();
        let ids = load_map_str(&mut problem, &Registry::with_defaults(), text).unwrap();

        assert_eq!(ids.len(), 1);
        assert_relative_eq!(problem.landmark_values(ids[0]).unwrap()[1], 4.0);
    }

    #[test]
    fn test_save_then_load_preserves_landmarks() {
        let mut problem = problem_with_anchor(0.5);
        let anchor = problem.key_frame_at(0.5).unwrap();
        problem
            .add_landmark(LandmarkKind::Point2D, DVector::from_row_slice(&[1.5, -2.0]), None)
            .unwrap();
        problem
            .add_landmark(
                LandmarkKind::Ahp { anchor },
                DVector::from_row_slice(&[0.6, 0.0, 0.8, 0.25]),
                Some(Descriptor(vec![0xAB, 0x01])),
            )
            .unwrap();

        let text = save_map_str(&problem).unwrap();

        let mut reloaded = problem_with_anchor(0.5);
        let ids = load_map_str(&mut reloaded, &Registry::with_defaults(), &text).unwrap();
        assert_eq!(ids.len(), 2);

        let point = reloaded.landmark(ids[0]).unwrap();
        assert_eq!(point.kind, LandmarkKind::Point2D);
        assert_relative_eq!(reloaded.landmark_values(ids[0]).unwrap()[0], 1.5);

        let ahp = reloaded.landmark(ids[1]).unwrap();
        assert!(matches!(ahp.kind, LandmarkKind::Ahp { .. }));
        assert_eq!(ahp.descriptor, Some(Descriptor(vec![0xAB, 0x01])));
        assert_relative_eq!(reloaded.landmark_values(ids[1]).unwrap()[3], 0.25);
    }

    #[test]
    fn test_ahp_without_anchor_fails() {
        let text = r#"
nlandmarks: 1
landmarks:
  - type: AHP
    anchor_ts: 4.0
    parameters: [0, 0, 1, 1]
"#;
        let mut problem = problem_with_anchor(0.5);
        let err = load_map_str(&mut problem, &Registry::with_defaults(), text).unwrap_err();
        assert!(matches!(err, EstimationError::NotFound(_)));
    }

    #[test]
    fn test_failed_entry_discards_loaded_landmarks() {
        let text = r#"
nlandmarks: 2
landmarks:
  - type: POINT 2D
    position: [1.0, 2.0]
  - type: POINT 3D
    position: [1.0, 2.0]
"#;
        let mut problem = Problem::new();
        let err = load_map_str(&mut problem, &Registry::with_defaults(), text).unwrap_err();

        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 3, found: 2, .. }));
        assert_eq!(problem.landmarks().count(), 0);
        problem.check_invariants().unwrap();
    }
}
