//! Records kept by the storage backends.
//!
//! Values are stored as JSON so fields can be added without migrations.

use crate::output::OutputEvent;
use crate::state::{SnapshotId, StateSnapshot};
use serde::{Deserialize, Serialize};
use slroom_proto::{Event, EventId, Membership, RoomId, RoomVersion, ServerName, StateKeyTuple, UserId};

/// How an event entered the room graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventStatus {
    /// Part of the live timeline, with state.
    Accepted,
    /// Known only as part of an auth chain or state set. No state.
    Outlier,
    /// Arrived through backfill. Has state only if its prev events did.
    Historical,
    /// Failed authorization. Kept for audit, never part of state.
    Rejected { reason: String },
}

/// An event plus what the pipeline decided about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: Event,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_before: Option<SnapshotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_after: Option<SnapshotId>,
}

impl StoredEvent {
    pub fn event_id(&self) -> &EventId {
        self.event.event_id()
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.status, EventStatus::Rejected { .. })
    }

    pub fn is_outlier(&self) -> bool {
        self.status == EventStatus::Outlier
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match &self.status {
            EventStatus::Rejected { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Per-room bookkeeping maintained by the input pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub version: RoomVersion,
    /// Sorted ids of events with no known children.
    pub forward_extremities: Vec<EventId>,
    pub current_state: SnapshotId,
    /// Greatest depth of any accepted event.
    pub depth: u64,
}

/// A local view of one user's membership in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub membership: Membership,
    /// Member event behind the record. For a leave recorded because the
    /// user's slot dropped out of current state, the dropped event.
    pub event_id: EventId,
    /// Whether the user has ever been joined since the record was created.
    #[serde(default)]
    pub joined_before: bool,
}

/// A local device peeking a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeekRecord {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub device_id: String,
    pub created_at: i64,
}

/// A remote server peeking a room through us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundPeekRecord {
    pub room_id: RoomId,
    pub server_name: ServerName,
    pub peek_id: String,
    pub renewal_interval_ms: u64,
    pub created_at: i64,
}

/// Persisted form of a state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotEntries {
    pub entries: Vec<(StateKeyTuple, EventId)>,
}

impl From<&StateSnapshot> for SnapshotEntries {
    fn from(snapshot: &StateSnapshot) -> Self {
        Self {
            entries: snapshot.entries(),
        }
    }
}

/// Everything the pipeline writes for one event, applied atomically.
#[derive(Debug, Clone)]
pub struct EventCommit {
    pub event: StoredEvent,
    /// Snapshots referenced by the event or the room record.
    pub snapshots: Vec<StateSnapshot>,
    /// Updated room record, when the event changes the live room.
    pub room: Option<RoomRecord>,
    pub memberships: Vec<MembershipRecord>,
    /// Output events to append to the room's log.
    pub outputs: Vec<OutputEvent>,
}

impl EventCommit {
    pub fn new(event: StoredEvent) -> Self {
        Self {
            event,
            snapshots: Vec::new(),
            room: None,
            memberships: Vec::new(),
            outputs: Vec::new(),
        }
    }
}
