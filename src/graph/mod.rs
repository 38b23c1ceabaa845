//! The estimation graph: typed handles, the ownership tree and its entities.
//!
//! ```text
//! Problem ─┬─ Trajectory ── Frame ── Capture ── Feature ── Constraint
//!          ├─ Map ── Landmark
//!          └─ Hardware ── Sensor
//! ```
//!
//! Constraints additionally refer to the state blocks of frames, landmarks and
//! sensors they bind; those links are handles, not ownership.

pub mod capture;
pub mod feature;
pub mod frame;
pub mod landmark;
pub mod node_tree;
pub mod sensor;
pub mod state_block;
pub mod types;

pub use capture::{Capture, CaptureData};
pub use feature::{Descriptor, Feature, FeatureKind, Keypoint, LandmarkMatch};
pub use frame::{Frame, FrameKind, FrameStructure};
pub use landmark::{Landmark, LandmarkKind};
pub use node_tree::{NodeKind, NodeTree};
pub use sensor::{Sensor, SensorKind};
pub use state_block::{LocalParameterization, StateBlock, StateBlockStore, StateOwner};
pub use types::{
    CaptureId, ConstraintId, FeatureId, FrameId, LandmarkId, NodeId, ProcessorId, SensorId,
    StateBlockId,
};
