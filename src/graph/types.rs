//! Core handle types for the estimation graph.
//!
//! Every node of the ownership tree is addressed by a [`NodeId`]. The typed
//! wrappers below carry the node's role so that a `FrameId` can never be
//! passed where a `LandmarkId` is expected. Handles are plain `Copy` values;
//! the entities themselves live in arenas owned by the problem.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of any node or state block in the process.
///
/// Ids are drawn from a single process-wide counter, so they are unique
/// across node kinds and across problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Draw the next unused id.
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "N{}", self.0)
    }
}

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub NodeId);

        impl $name {
            /// Allocate a fresh id.
            pub fn next() -> Self {
                Self(NodeId::next())
            }

            /// The underlying tree node.
            pub fn node(self) -> NodeId {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0 .0)
            }
        }
    };
}

typed_id!(
    /// Handle to a Frame in the trajectory.
    FrameId,
    "F"
);
typed_id!(
    /// Handle to a Capture (one sensor reading).
    CaptureId,
    "C"
);
typed_id!(
    /// Handle to a Feature extracted from a Capture.
    FeatureId,
    "f"
);
typed_id!(
    /// Handle to a Constraint (residual term).
    ConstraintId,
    "c"
);
typed_id!(
    /// Handle to a Landmark in the map.
    LandmarkId,
    "L"
);
typed_id!(
    /// Handle to an installed Sensor.
    SensorId,
    "S"
);
typed_id!(
    /// Handle to a StateBlock. State blocks are not tree nodes but share the id space.
    StateBlockId,
    "B"
);

/// Index of a processor in the estimator, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId(pub usize);

impl std::fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_across_kinds() {
        let f = FrameId::next();
        let c = CaptureId::next();
        let l = LandmarkId::next();

        assert_ne!(f.node(), c.node());
        assert_ne!(c.node(), l.node());
    }

    #[test]
    fn test_frame_id_display() {
        let id = FrameId(NodeId(7));
        assert_eq!(format!("{}", id), "F7");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let a = LandmarkId::next();
        let b = LandmarkId::next();
        let mut map: HashMap<LandmarkId, &str> = HashMap::new();
        map.insert(a, "first");

        assert_eq!(map.get(&a), Some(&"first"));
        assert_eq!(map.get(&b), None);
    }
}
