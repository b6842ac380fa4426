//! In-memory storage backend.
//!
//! Everything lives behind one lock, so [`Database::commit_event`] is atomic
//! with respect to every reader. Used by tests and by in-process peer servers.

use super::types::SnapshotEntries;
use super::{
    Database, EventCommit, InboundPeekRecord, MembershipRecord, PeekRecord, RoomRecord,
    StorageError, StoredEvent,
};
use crate::output::{OutputEvent, OutputRecord};
use crate::state::{SnapshotId, StateSnapshot};
use async_trait::async_trait;
use parking_lot::RwLock;
use slroom_proto::{EventId, RoomId, UserId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Default)]
struct Inner {
    events: HashMap<EventId, StoredEvent>,
    snapshots: HashMap<SnapshotId, SnapshotEntries>,
    rooms: HashMap<RoomId, RoomRecord>,
    memberships: BTreeMap<(UserId, RoomId), MembershipRecord>,
    peeks: BTreeMap<(RoomId, UserId, String), PeekRecord>,
    inbound_peeks: BTreeMap<(RoomId, String, String), InboundPeekRecord>,
    output: HashMap<RoomId, Vec<OutputRecord>>,
    published: BTreeSet<RoomId>,
}

impl Inner {
    fn append(&mut self, room_id: &RoomId, events: Vec<OutputEvent>) -> Vec<OutputRecord> {
        let log = self.output.entry(room_id.clone()).or_default();
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let record = OutputRecord {
                room_id: room_id.clone(),
                seq: log.len() as u64 + 1,
                event,
            };
            log.push(record.clone());
            records.push(record);
        }
        records
    }
}

#[derive(Default)]
pub struct MemoryDatabase {
    inner: RwLock<Inner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn room(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, StorageError> {
        Ok(self.inner.read().rooms.get(room_id).cloned())
    }

    async fn event(&self, event_id: &EventId) -> Result<Option<StoredEvent>, StorageError> {
        Ok(self.inner.read().events.get(event_id).cloned())
    }

    async fn events(&self, event_ids: &[EventId]) -> Result<Vec<StoredEvent>, StorageError> {
        let inner = self.inner.read();
        Ok(event_ids
            .iter()
            .filter_map(|id| inner.events.get(id).cloned())
            .collect())
    }

    async fn snapshot(&self, id: &SnapshotId) -> Result<Option<StateSnapshot>, StorageError> {
        Ok(self
            .inner
            .read()
            .snapshots
            .get(id)
            .map(|s| StateSnapshot::from_entries(s.entries.clone())))
    }

    async fn commit_event(&self, commit: EventCommit) -> Result<Vec<OutputRecord>, StorageError> {
        let mut inner = self.inner.write();
        let room_id = commit.event.event.room_id().clone();
        for snapshot in &commit.snapshots {
            inner
                .snapshots
                .entry(snapshot.id().clone())
                .or_insert_with(|| SnapshotEntries::from(snapshot));
        }
        inner
            .events
            .insert(commit.event.event_id().clone(), commit.event);
        if let Some(room) = commit.room {
            inner.rooms.insert(room.room_id.clone(), room);
        }
        for record in commit.memberships {
            inner
                .memberships
                .insert((record.user_id.clone(), record.room_id.clone()), record);
        }
        Ok(inner.append(&room_id, commit.outputs))
    }

    async fn append_output(
        &self,
        room_id: &RoomId,
        events: Vec<OutputEvent>,
    ) -> Result<Vec<OutputRecord>, StorageError> {
        Ok(self.inner.write().append(room_id, events))
    }

    async fn output_since(
        &self,
        room_id: &RoomId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<OutputRecord>, StorageError> {
        let inner = self.inner.read();
        Ok(inner
            .output
            .get(room_id)
            .map(|log| {
                log.iter()
                    .filter(|r| r.seq > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Option<MembershipRecord>, StorageError> {
        Ok(self
            .inner
            .read()
            .memberships
            .get(&(user_id.clone(), room_id.clone()))
            .cloned())
    }

    async fn memberships_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<MembershipRecord>, StorageError> {
        Ok(self
            .inner
            .read()
            .memberships
            .values()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn purge_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<bool, StorageError> {
        Ok(self
            .inner
            .write()
            .memberships
            .remove(&(user_id.clone(), room_id.clone()))
            .is_some())
    }

    async fn add_peek(&self, peek: PeekRecord) -> Result<(), StorageError> {
        let key = (peek.room_id.clone(), peek.user_id.clone(), peek.device_id.clone());
        self.inner.write().peeks.insert(key, peek);
        Ok(())
    }

    async fn remove_peek(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        device_id: &str,
    ) -> Result<bool, StorageError> {
        let key = (room_id.clone(), user_id.clone(), device_id.to_string());
        Ok(self.inner.write().peeks.remove(&key).is_some())
    }

    async fn peeks(&self, room_id: &RoomId) -> Result<Vec<PeekRecord>, StorageError> {
        Ok(self
            .inner
            .read()
            .peeks
            .values()
            .filter(|p| &p.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn add_inbound_peek(&self, peek: InboundPeekRecord) -> Result<(), StorageError> {
        let key = (
            peek.room_id.clone(),
            peek.server_name.to_string(),
            peek.peek_id.clone(),
        );
        self.inner.write().inbound_peeks.insert(key, peek);
        Ok(())
    }

    async fn inbound_peeks(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<InboundPeekRecord>, StorageError> {
        Ok(self
            .inner
            .read()
            .inbound_peeks
            .values()
            .filter(|p| &p.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn set_published(&self, room_id: &RoomId, published: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if published {
            inner.published.insert(room_id.clone());
        } else {
            inner.published.remove(room_id);
        }
        Ok(())
    }

    async fn published_rooms(&self) -> Result<Vec<RoomId>, StorageError> {
        Ok(self.inner.read().published.iter().cloned().collect())
    }
}
