//! Output event stream.
//!
//! Every change that downstream consumers must observe is written as an
//! [`OutputRecord`] to a durable per-room log (inside the same storage
//! transaction as the change that caused it) and then broadcast live. The
//! per-room sequence number orders records within a room; records from
//! different rooms are unordered.

use serde::{Deserialize, Serialize};
use slroom_proto::{Event, EventId, Membership, RoomId, RoomVersion, ServerName, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A change published to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// An event was accepted into the room's live timeline.
    NewRoomEvent {
        event: Event,
        added_state_event_ids: Vec<EventId>,
        removed_state_event_ids: Vec<EventId>,
        latest_event_ids: Vec<EventId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
    },
    /// A historical event arrived through backfill.
    OldRoomEvent { event: Event },
    /// A local user was invited.
    NewInviteEvent {
        event: Event,
        room_version: RoomVersion,
    },
    /// A local user's pending invite no longer applies.
    RetireInviteEvent {
        event_id: EventId,
        target: UserId,
        membership: Membership,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retired_by: Option<EventId>,
    },
    /// A local device started peeking a room.
    NewPeek {
        room_id: RoomId,
        user_id: UserId,
        device_id: String,
    },
    /// A remote server started peeking a room through us.
    NewInboundPeek {
        room_id: RoomId,
        server_name: ServerName,
        peek_id: String,
        latest_event_id: EventId,
        renewal_interval_ms: u64,
    },
    /// A local device stopped peeking a room.
    RetirePeek {
        room_id: RoomId,
        user_id: UserId,
        device_id: String,
    },
}

impl OutputEvent {
    /// Label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewRoomEvent { .. } => "new_room_event",
            Self::OldRoomEvent { .. } => "old_room_event",
            Self::NewInviteEvent { .. } => "new_invite_event",
            Self::RetireInviteEvent { .. } => "retire_invite_event",
            Self::NewPeek { .. } => "new_peek",
            Self::NewInboundPeek { .. } => "new_inbound_peek",
            Self::RetirePeek { .. } => "retire_peek",
        }
    }
}

/// An output event with its place in the room's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub room_id: RoomId,
    pub seq: u64,
    pub event: OutputEvent,
}

/// Live feed of committed output records.
///
/// Consumers that fall behind the broadcast buffer should catch up from the
/// durable log with [`crate::storage::Database::output_since`].
#[derive(Clone)]
pub struct OutputStream {
    tx: broadcast::Sender<Arc<OutputRecord>>,
}

impl OutputStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<OutputRecord>> {
        self.tx.subscribe()
    }

    /// Publish already-committed records, in order.
    pub fn publish(&self, records: Vec<OutputRecord>) {
        crate::metrics::record_output(records.len());
        for record in records {
            tracing::debug!(
                room_id = %record.room_id,
                seq = record.seq,
                kind = record.event.kind(),
                "Output event"
            );
            // No subscribers is fine; the durable log still has the record.
            let _ = self.tx.send(Arc::new(record));
        }
    }
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new(1024)
    }
}
