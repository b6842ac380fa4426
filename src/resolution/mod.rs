//! State resolution.
//!
//! [`resolve_state`] merges several candidate state maps into one. It is a
//! pure function of its inputs: the same set of candidates yields the same
//! result on every server regardless of the order they are passed in. All
//! events it may need (candidate state plus their auth chains) are loaded
//! up front by [`load_inputs`].

mod v2;

use crate::state::{EventMap, StateMap};
use crate::storage::{Database, StorageError};
use slroom_proto::{Event, EventId, RoomVersion, StateResAlgorithm};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("events needed for resolution are missing: {0:?}")]
    MissingEvents(Vec<EventId>),
}

/// Resolve `snapshots` into a single state map.
pub fn resolve_state(
    version: RoomVersion,
    snapshots: &[StateMap],
    events: &EventMap,
) -> Result<StateMap, ResolutionError> {
    let Some(first) = snapshots.first() else {
        return Ok(StateMap::new());
    };
    if snapshots.iter().all(|s| s == first) {
        crate::metrics::record_resolution(true, 0.0);
        return Ok(first.clone());
    }

    let start = Instant::now();
    let resolved = match version.rules().state_res {
        StateResAlgorithm::V2 => v2::resolve(snapshots, events),
    };
    crate::metrics::record_resolution(false, start.elapsed().as_secs_f64());
    resolved
}

/// Load every event referenced by `snapshots` and their full auth chains.
///
/// Events that storage does not hold are left out; resolution reports them
/// if it turns out to need them.
pub async fn load_inputs(
    db: &dyn Database,
    snapshots: &[StateMap],
) -> Result<EventMap, StorageError> {
    load_inputs_with(db, snapshots, &[]).await
}

/// Like [`load_inputs`], for candidates that reference `pending` events not
/// yet committed to storage.
pub async fn load_inputs_with(
    db: &dyn Database,
    snapshots: &[StateMap],
    pending: &[Arc<Event>],
) -> Result<EventMap, StorageError> {
    let mut events: EventMap = pending
        .iter()
        .map(|e| (e.event_id().clone(), Arc::clone(e)))
        .collect();
    let mut frontier: BTreeSet<EventId> = snapshots
        .iter()
        .flat_map(|s| s.values().cloned())
        .chain(pending.iter().flat_map(|e| e.auth_events().iter().cloned()))
        .filter(|id| !events.contains_key(id))
        .collect();

    while !frontier.is_empty() {
        let batch: Vec<EventId> = frontier.into_iter().collect();
        let loaded = db.events(&batch).await?;
        frontier = BTreeSet::new();
        for stored in loaded {
            for auth_id in stored.event.auth_events() {
                if !events.contains_key(auth_id) && !batch.contains(auth_id) {
                    frontier.insert(auth_id.clone());
                }
            }
            events.insert(stored.event.event_id().clone(), Arc::new(stored.event));
        }
        frontier.retain(|id| !events.contains_key(id));
    }

    Ok(events)
}
