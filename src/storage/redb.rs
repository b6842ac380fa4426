//! Redb-backed persistent storage.
//!
//! Implements [`Database`] using the redb embedded database. Values are JSON;
//! composite keys join their parts with `\0` so a prefix range scan finds
//! every record for one room or user.

use super::types::SnapshotEntries;
use super::{
    Database, EventCommit, InboundPeekRecord, MembershipRecord, PeekRecord, RoomRecord,
    StorageError, StoredEvent,
};
use crate::output::{OutputEvent, OutputRecord};
use crate::state::{SnapshotId, StateSnapshot};
use async_trait::async_trait;
use redb::{ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use slroom_proto::{EventId, RoomId, UserId};
use std::sync::Arc;

const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
const ROOMS: TableDefinition<&str, &[u8]> = TableDefinition::new("rooms");
/// Keyed by `user\0room`.
const MEMBERSHIPS: TableDefinition<&str, &[u8]> = TableDefinition::new("memberships");
/// Keyed by `room\0user\0device`.
const PEEKS: TableDefinition<&str, &[u8]> = TableDefinition::new("peeks");
/// Keyed by `room\0server\0peek_id`.
const INBOUND_PEEKS: TableDefinition<&str, &[u8]> = TableDefinition::new("inbound_peeks");
/// Keyed by `room\0{seq:020}`.
const OUTPUT_LOG: TableDefinition<&str, &[u8]> = TableDefinition::new("output_log");
const OUTPUT_SEQ: TableDefinition<&str, u64> = TableDefinition::new("output_seq");
const PUBLISHED: TableDefinition<&str, u8> = TableDefinition::new("published");

fn db_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Database(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Range bounds covering every key that starts with `prefix\0`.
fn prefix_range(prefix: &str) -> (String, String) {
    (format!("{prefix}\0"), format!("{prefix}\u{1}"))
}

pub struct RedbDatabase {
    db: Arc<redb::Database>,
}

impl RedbDatabase {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let db = redb::Database::create(path).map_err(db_err)?;
        // Create every table up front so read transactions never miss one.
        let txn = db.begin_write().map_err(db_err)?;
        {
            for def in [EVENTS, SNAPSHOTS, ROOMS, MEMBERSHIPS, PEEKS, INBOUND_PEEKS, OUTPUT_LOG] {
                txn.open_table(def).map_err(db_err)?;
            }
            txn.open_table(OUTPUT_SEQ).map_err(db_err)?;
            txn.open_table(PUBLISHED).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(def).map_err(db_err)?;
        match table.get(key).map_err(db_err)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> Result<Vec<T>, StorageError> {
        let (start, end) = prefix_range(prefix);
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(def).map_err(db_err)?;
        let mut found = Vec::new();
        for item in table.range(start.as_str()..end.as_str()).map_err(db_err)? {
            let (_k, v) = item.map_err(db_err)?;
            found.push(decode(v.value())?);
        }
        Ok(found)
    }

    fn put_json<T: Serialize>(
        txn: &WriteTransaction,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = encode(value)?;
        let mut table = txn.open_table(def).map_err(db_err)?;
        table.insert(key, bytes.as_slice()).map_err(db_err)?;
        Ok(())
    }

    fn append_in(
        txn: &WriteTransaction,
        room_id: &RoomId,
        events: Vec<OutputEvent>,
    ) -> Result<Vec<OutputRecord>, StorageError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut seq_table = txn.open_table(OUTPUT_SEQ).map_err(db_err)?;
        let mut seq = seq_table
            .get(room_id.as_str())
            .map_err(db_err)?
            .map(|g| g.value())
            .unwrap_or(0);
        let mut log = txn.open_table(OUTPUT_LOG).map_err(db_err)?;
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            seq += 1;
            let record = OutputRecord {
                room_id: room_id.clone(),
                seq,
                event,
            };
            let key = format!("{}\0{:020}", room_id, seq);
            let bytes = encode(&record)?;
            log.insert(key.as_str(), bytes.as_slice()).map_err(db_err)?;
            records.push(record);
        }
        seq_table.insert(room_id.as_str(), seq).map_err(db_err)?;
        Ok(records)
    }
}

#[async_trait]
impl Database for RedbDatabase {
    async fn ping(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        txn.open_table(ROOMS).map_err(db_err)?;
        Ok(())
    }

    async fn room(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, StorageError> {
        self.get_json(ROOMS, room_id.as_str())
    }

    async fn event(&self, event_id: &EventId) -> Result<Option<StoredEvent>, StorageError> {
        self.get_json(EVENTS, event_id.as_str())
    }

    async fn events(&self, event_ids: &[EventId]) -> Result<Vec<StoredEvent>, StorageError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(EVENTS).map_err(db_err)?;
        let mut found = Vec::with_capacity(event_ids.len());
        for id in event_ids {
            if let Some(guard) = table.get(id.as_str()).map_err(db_err)? {
                found.push(decode(guard.value())?);
            }
        }
        Ok(found)
    }

    async fn snapshot(&self, id: &SnapshotId) -> Result<Option<StateSnapshot>, StorageError> {
        let entries: Option<SnapshotEntries> = self.get_json(SNAPSHOTS, id.as_str())?;
        Ok(entries.map(|e| StateSnapshot::from_entries(e.entries)))
    }

    async fn commit_event(&self, commit: EventCommit) -> Result<Vec<OutputRecord>, StorageError> {
        let room_id = commit.event.event.room_id().clone();
        let txn = self.db.begin_write().map_err(db_err)?;
        let records = {
            for snapshot in &commit.snapshots {
                Self::put_json(&txn, SNAPSHOTS, snapshot.id().as_str(), &SnapshotEntries::from(snapshot))?;
            }
            Self::put_json(&txn, EVENTS, commit.event.event_id().as_str(), &commit.event)?;
            if let Some(room) = &commit.room {
                Self::put_json(&txn, ROOMS, room.room_id.as_str(), room)?;
            }
            for record in &commit.memberships {
                let key = format!("{}\0{}", record.user_id, record.room_id);
                Self::put_json(&txn, MEMBERSHIPS, &key, record)?;
            }
            Self::append_in(&txn, &room_id, commit.outputs)?
        };
        txn.commit().map_err(db_err)?;
        Ok(records)
    }

    async fn append_output(
        &self,
        room_id: &RoomId,
        events: Vec<OutputEvent>,
    ) -> Result<Vec<OutputRecord>, StorageError> {
        let txn = self.db.begin_write().map_err(db_err)?;
        let records = Self::append_in(&txn, room_id, events)?;
        txn.commit().map_err(db_err)?;
        Ok(records)
    }

    async fn output_since(
        &self,
        room_id: &RoomId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<OutputRecord>, StorageError> {
        let start = format!("{}\0{:020}", room_id, after.saturating_add(1));
        let (_, end) = prefix_range(room_id.as_str());
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(OUTPUT_LOG).map_err(db_err)?;
        let mut records = Vec::new();
        for item in table.range(start.as_str()..end.as_str()).map_err(db_err)? {
            if records.len() >= limit {
                break;
            }
            let (_k, v) = item.map_err(db_err)?;
            records.push(decode(v.value())?);
        }
        Ok(records)
    }

    async fn membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Option<MembershipRecord>, StorageError> {
        self.get_json(MEMBERSHIPS, &format!("{}\0{}", user_id, room_id))
    }

    async fn memberships_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<MembershipRecord>, StorageError> {
        self.scan_json(MEMBERSHIPS, user_id.as_str())
    }

    async fn purge_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<bool, StorageError> {
        let key = format!("{}\0{}", user_id, room_id);
        let txn = self.db.begin_write().map_err(db_err)?;
        let existed = {
            let mut table = txn.open_table(MEMBERSHIPS).map_err(db_err)?;
            let removed = table.remove(key.as_str()).map_err(db_err)?;
            removed.is_some()
        };
        txn.commit().map_err(db_err)?;
        Ok(existed)
    }

    async fn add_peek(&self, peek: PeekRecord) -> Result<(), StorageError> {
        let key = format!("{}\0{}\0{}", peek.room_id, peek.user_id, peek.device_id);
        let txn = self.db.begin_write().map_err(db_err)?;
        Self::put_json(&txn, PEEKS, &key, &peek)?;
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    async fn remove_peek(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        device_id: &str,
    ) -> Result<bool, StorageError> {
        let key = format!("{}\0{}\0{}", room_id, user_id, device_id);
        let txn = self.db.begin_write().map_err(db_err)?;
        let existed = {
            let mut table = txn.open_table(PEEKS).map_err(db_err)?;
            let removed = table.remove(key.as_str()).map_err(db_err)?;
            removed.is_some()
        };
        txn.commit().map_err(db_err)?;
        Ok(existed)
    }

    async fn peeks(&self, room_id: &RoomId) -> Result<Vec<PeekRecord>, StorageError> {
        self.scan_json(PEEKS, room_id.as_str())
    }

    async fn add_inbound_peek(&self, peek: InboundPeekRecord) -> Result<(), StorageError> {
        let key = format!("{}\0{}\0{}", peek.room_id, peek.server_name, peek.peek_id);
        let txn = self.db.begin_write().map_err(db_err)?;
        Self::put_json(&txn, INBOUND_PEEKS, &key, &peek)?;
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    async fn inbound_peeks(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<InboundPeekRecord>, StorageError> {
        self.scan_json(INBOUND_PEEKS, room_id.as_str())
    }

    async fn set_published(&self, room_id: &RoomId, published: bool) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(PUBLISHED).map_err(db_err)?;
            if published {
                table.insert(room_id.as_str(), 1u8).map_err(db_err)?;
            } else {
                table.remove(room_id.as_str()).map_err(db_err)?;
            }
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    async fn published_rooms(&self) -> Result<Vec<RoomId>, StorageError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(PUBLISHED).map_err(db_err)?;
        let mut rooms = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (k, _v) = item.map_err(db_err)?;
            let room = RoomId::parse(k.value()).map_err(|e| StorageError::Serialization(e.to_string()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EventStatus;
    use serde_json::json;
    use slroom_proto::{EventBuilder, Membership, RoomVersion, event_type};

    fn open() -> (tempfile::TempDir, RedbDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.redb");
        let db = RedbDatabase::new(path.to_str().unwrap()).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn commit_roundtrips_through_disk() {
        let (_dir, db) = open();
        let room_id = RoomId::parse("!r:a.example").unwrap();
        let alice = UserId::parse("@alice:a.example").unwrap();
        let create = EventBuilder::new(room_id.clone(), alice.clone(), event_type::CREATE, json!({"room_version": "10"}))
            .state_key("")
            .build();
        let snapshot = StateSnapshot::empty().with_event(&create);
        let mut commit = EventCommit::new(StoredEvent {
            event: create.clone(),
            status: EventStatus::Accepted,
            state_before: Some(StateSnapshot::empty().id().clone()),
            state_after: Some(snapshot.id().clone()),
        });
        commit.snapshots = vec![snapshot.clone()];
        commit.room = Some(RoomRecord {
            room_id: room_id.clone(),
            version: RoomVersion::V10,
            forward_extremities: vec![create.event_id().clone()],
            current_state: snapshot.id().clone(),
            depth: 1,
        });
        commit.memberships.push(MembershipRecord {
            room_id: room_id.clone(),
            user_id: alice.clone(),
            membership: Membership::Join,
            event_id: create.event_id().clone(),
            joined_before: true,
        });
        commit.outputs = vec![OutputEvent::OldRoomEvent { event: create.clone() }];
        db.commit_event(commit).await.unwrap();

        assert_eq!(db.event(create.event_id()).await.unwrap().unwrap().event, create);
        assert_eq!(db.snapshot(snapshot.id()).await.unwrap().unwrap(), snapshot);
        assert_eq!(db.room(&room_id).await.unwrap().unwrap().version, RoomVersion::V10);
        assert_eq!(db.memberships_for_user(&alice).await.unwrap().len(), 1);
        assert_eq!(db.output_since(&room_id, 0, 10).await.unwrap()[0].seq, 1);
        assert!(db.output_since(&room_id, 1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn output_log_is_per_room() {
        let (_dir, db) = open();
        let a = RoomId::parse("!a:a.example").unwrap();
        let b = RoomId::parse("!b:a.example").unwrap();
        let user = UserId::parse("@u:a.example").unwrap();
        let peek = |room: &RoomId| OutputEvent::NewPeek {
            room_id: room.clone(),
            user_id: user.clone(),
            device_id: "D".into(),
        };
        db.append_output(&a, vec![peek(&a), peek(&a)]).await.unwrap();
        let records = db.append_output(&b, vec![peek(&b)]).await.unwrap();
        assert_eq!(records[0].seq, 1);
        assert_eq!(db.output_since(&a, 0, 10).await.unwrap().len(), 2);
        assert_eq!(db.output_since(&a, 0, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn peeks_and_publication() {
        let (_dir, db) = open();
        let room_id = RoomId::parse("!r:a.example").unwrap();
        let user = UserId::parse("@u:a.example").unwrap();
        db.add_peek(PeekRecord {
            room_id: room_id.clone(),
            user_id: user.clone(),
            device_id: "D".into(),
            created_at: 0,
        })
        .await
        .unwrap();
        assert_eq!(db.peeks(&room_id).await.unwrap().len(), 1);
        assert!(db.remove_peek(&room_id, &user, "D").await.unwrap());
        assert!(!db.remove_peek(&room_id, &user, "D").await.unwrap());

        db.set_published(&room_id, true).await.unwrap();
        assert_eq!(db.published_rooms().await.unwrap(), vec![room_id.clone()]);
        db.set_published(&room_id, false).await.unwrap();
        assert!(db.published_rooms().await.unwrap().is_empty());
    }
}
