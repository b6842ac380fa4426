//! Immutable state snapshots.
//!
//! A [`StateMap`] is a persistent ordered map from state key tuple to event id.
//! Cloning one is cheap, so snapshots are passed around by value. The
//! [`SnapshotId`] is a hash of the sorted entries, which makes identical
//! states share one id and lets a non-state event carry its pre-state id
//! forward unchanged.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use slroom_proto::{Event, EventId, StateKeyTuple};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// State as a map from (type, state key) to event id.
pub type StateMap = im::OrdMap<StateKeyTuple, EventId>;

/// Events by id, as loaded for authorization and resolution.
pub type EventMap = HashMap<EventId, Arc<Event>>;

/// Content hash of a [`StateMap`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Hash the sorted entries of `state`.
    pub fn of(state: &StateMap) -> Self {
        let mut hasher = Sha256::new();
        for (tuple, event_id) in state.iter() {
            hasher.update(tuple.event_type.as_bytes());
            hasher.update([0]);
            hasher.update(tuple.state_key.as_bytes());
            hasher.update([0]);
            hasher.update(event_id.as_str().as_bytes());
            hasher.update([b'\n']);
        }
        Self(format!("s:{}", URL_SAFE_NO_PAD.encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A state map together with its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    id: SnapshotId,
    state: StateMap,
}

impl StateSnapshot {
    pub fn new(state: StateMap) -> Self {
        Self {
            id: SnapshotId::of(&state),
            state,
        }
    }

    pub fn empty() -> Self {
        Self::new(StateMap::new())
    }

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn into_state(self) -> StateMap {
        self.state
    }

    pub fn get(&self, tuple: &StateKeyTuple) -> Option<&EventId> {
        self.state.get(tuple)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// The snapshot after `event`. Non-state events leave it unchanged.
    pub fn with_event(&self, event: &Event) -> StateSnapshot {
        match event.state_key_tuple() {
            Some(tuple) => Self::new(self.state.update(tuple, event.event_id().clone())),
            None => self.clone(),
        }
    }

    /// Event ids for the requested tuples, or every event when `tuples` is empty.
    pub fn event_ids(&self, tuples: &[StateKeyTuple]) -> Vec<EventId> {
        if tuples.is_empty() {
            return self.state.values().cloned().collect();
        }
        tuples
            .iter()
            .filter_map(|t| self.state.get(t).cloned())
            .collect()
    }

    /// Entries in key order, for persistence.
    pub fn entries(&self) -> Vec<(StateKeyTuple, EventId)> {
        self.state
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn from_entries(entries: Vec<(StateKeyTuple, EventId)>) -> Self {
        Self::new(entries.into_iter().collect())
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Event ids entering and leaving state between two maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub added: Vec<EventId>,
    pub removed: Vec<EventId>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compute the delta from `old` to `new`.
pub fn state_delta(old: &StateMap, new: &StateMap) -> StateDelta {
    let mut added = BTreeSet::new();
    let mut removed = BTreeSet::new();
    for (tuple, id) in new.iter() {
        if old.get(tuple) != Some(id) {
            added.insert(id.clone());
        }
    }
    for (tuple, id) in old.iter() {
        if new.get(tuple) != Some(id) {
            removed.insert(id.clone());
        }
    }
    StateDelta {
        added: added.into_iter().collect(),
        removed: removed.into_iter().collect(),
    }
}
