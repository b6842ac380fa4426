//! Room state representation.

pub mod snapshot;

pub use snapshot::{EventMap, SnapshotId, StateDelta, StateMap, StateSnapshot, state_delta};
