//! Storage abstraction.
//!
//! The input pipeline is the only writer of events, snapshots, room records
//! and memberships, always through [`Database::commit_event`] so an event and
//! everything derived from it land in one transaction. Queries and
//! performers read through the same trait.

use crate::output::{OutputEvent, OutputRecord};
use crate::state::{SnapshotId, StateSnapshot};
use async_trait::async_trait;
use slroom_proto::{EventId, RoomId, UserId};
use thiserror::Error;

pub mod memory;
pub mod redb;
pub mod types;

pub use types::{
    EventCommit, EventStatus, InboundPeekRecord, MembershipRecord, PeekRecord, RoomRecord,
    StoredEvent,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), StorageError>;

    async fn room(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, StorageError>;

    async fn event(&self, event_id: &EventId) -> Result<Option<StoredEvent>, StorageError>;

    /// Load the events that exist, in request order. Unknown ids are skipped.
    async fn events(&self, event_ids: &[EventId]) -> Result<Vec<StoredEvent>, StorageError> {
        let mut found = Vec::with_capacity(event_ids.len());
        for id in event_ids {
            if let Some(event) = self.event(id).await? {
                found.push(event);
            }
        }
        Ok(found)
    }

    async fn snapshot(&self, id: &SnapshotId) -> Result<Option<StateSnapshot>, StorageError>;

    /// Apply an event and everything derived from it atomically, returning the
    /// sequenced output records.
    async fn commit_event(&self, commit: EventCommit) -> Result<Vec<OutputRecord>, StorageError>;

    /// Append output events that have no accompanying room event.
    async fn append_output(
        &self,
        room_id: &RoomId,
        events: Vec<OutputEvent>,
    ) -> Result<Vec<OutputRecord>, StorageError>;

    /// Output records with a sequence number greater than `after`, oldest first.
    async fn output_since(
        &self,
        room_id: &RoomId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<OutputRecord>, StorageError>;

    async fn membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Option<MembershipRecord>, StorageError>;

    async fn memberships_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<MembershipRecord>, StorageError>;

    /// Remove a membership record. Returns whether one existed.
    async fn purge_membership(&self, room_id: &RoomId, user_id: &UserId)
    -> Result<bool, StorageError>;

    async fn add_peek(&self, peek: PeekRecord) -> Result<(), StorageError>;

    /// Remove a peek. Returns whether one existed.
    async fn remove_peek(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        device_id: &str,
    ) -> Result<bool, StorageError>;

    async fn peeks(&self, room_id: &RoomId) -> Result<Vec<PeekRecord>, StorageError>;

    async fn add_inbound_peek(&self, peek: InboundPeekRecord) -> Result<(), StorageError>;

    async fn inbound_peeks(&self, room_id: &RoomId)
    -> Result<Vec<InboundPeekRecord>, StorageError>;

    async fn set_published(&self, room_id: &RoomId, published: bool) -> Result<(), StorageError>;

    /// Published rooms in id order.
    async fn published_rooms(&self) -> Result<Vec<RoomId>, StorageError>;
}
