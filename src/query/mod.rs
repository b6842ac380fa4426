//! State query engine.
//!
//! Read-only views over what the input pipeline has committed. Queries never
//! resolve state themselves: they read the snapshots stored next to each
//! event and the room's current state.

use crate::api::*;
use crate::error::RoomserverError;
use crate::security::ServerAcls;
use crate::state::{SnapshotId, StateSnapshot};
use crate::storage::{Database, RoomRecord, StoredEvent};
use slroom_proto::{
    Event, EventId, HistoryVisibility, HistoryVisibilityContent, Membership, RoomId, ServerName,
    StateKeyTuple, UserId, event_type,
};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

pub struct Queryer {
    db: Arc<dyn Database>,
    acls: Arc<ServerAcls>,
    max_backfill: usize,
}

impl Queryer {
    pub fn new(db: Arc<dyn Database>, acls: Arc<ServerAcls>, max_backfill: usize) -> Self {
        Self {
            db,
            acls,
            max_backfill,
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    pub async fn query_current_state(
        &self,
        req: &QueryCurrentStateRequest,
    ) -> Result<QueryCurrentStateResponse, RoomserverError> {
        let current = self.current_state(&req.room_id).await?;
        Ok(QueryCurrentStateResponse {
            state_events: self.state_events(&current, &req.tuples).await?,
            ..Default::default()
        })
    }

    pub async fn query_state_event(
        &self,
        req: &QueryStateEventRequest,
    ) -> Result<QueryStateEventResponse, RoomserverError> {
        let current = self.current_state(&req.room_id).await?;
        let tuple = StateKeyTuple::new(req.event_type.as_str(), req.state_key.as_str());
        let event = match current.get(&tuple) {
            Some(id) => self.db.event(id).await?.map(|s| s.event),
            None => None,
        };
        Ok(QueryStateEventResponse {
            event,
            ..Default::default()
        })
    }

    pub async fn query_state_after_event(
        &self,
        req: &QueryStateAfterEventRequest,
    ) -> Result<QueryStateAtEventResponse, RoomserverError> {
        let stored = self.stored(&req.event_id).await?;
        let id = stored.state_after.ok_or_else(|| {
            RoomserverError::StateUnavailable(format!("no state after {}", req.event_id))
        })?;
        let snapshot = self.snapshot(&id).await?;
        Ok(QueryStateAtEventResponse {
            state_events: self.state_events(&snapshot, &req.tuples).await?,
            ..Default::default()
        })
    }

    pub async fn query_state_before_event(
        &self,
        req: &QueryStateBeforeEventRequest,
    ) -> Result<QueryStateAtEventResponse, RoomserverError> {
        let stored = self.stored(&req.event_id).await?;
        let snapshot = self.state_before(&stored).await?;
        Ok(QueryStateAtEventResponse {
            state_events: self.state_events(&snapshot, &[]).await?,
            ..Default::default()
        })
    }

    pub async fn query_latest_events_and_state(
        &self,
        req: &QueryLatestEventsAndStateRequest,
    ) -> Result<QueryLatestEventsAndStateResponse, RoomserverError> {
        let Some(room) = self.db.room(&req.room_id).await? else {
            return Ok(QueryLatestEventsAndStateResponse::default());
        };
        let current = self.snapshot(&room.current_state).await?;
        Ok(QueryLatestEventsAndStateResponse {
            room_exists: true,
            room_version: Some(room.version),
            state_events: self.state_events(&current, &req.tuples).await?,
            latest_event_ids: room.forward_extremities,
            depth: room.depth,
            ..Default::default()
        })
    }

    // ========================================================================
    // Membership
    // ========================================================================

    pub async fn query_members(
        &self,
        req: &QueryMembersRequest,
    ) -> Result<QueryMembersResponse, RoomserverError> {
        let current = self.current_state(&req.room_id).await?;
        let members = self
            .member_events(&current)
            .await?
            .into_iter()
            .filter(|event| {
                !req.joined_only || matches!(event.membership(), Ok(Some(Membership::Join)))
            })
            .collect();
        Ok(QueryMembersResponse {
            members,
            ..Default::default()
        })
    }

    pub async fn query_membership_for_user(
        &self,
        req: &QueryMembershipForUserRequest,
    ) -> Result<QueryMembershipForUserResponse, RoomserverError> {
        match self.db.membership(&req.room_id, &req.user_id).await? {
            Some(record) => Ok(QueryMembershipForUserResponse {
                is_in_room: record.membership == Membership::Join,
                has_been_in_room: record.joined_before || record.membership == Membership::Join,
                membership: Some(record.membership),
                event_id: Some(record.event_id),
                ..Default::default()
            }),
            None if self.db.room(&req.room_id).await?.is_some() => {
                Ok(QueryMembershipForUserResponse::default())
            }
            None => Err(RoomserverError::UnknownRoom(req.room_id.clone())),
        }
    }

    pub async fn query_rooms_for_user(
        &self,
        req: &QueryRoomsForUserRequest,
    ) -> Result<QueryRoomsForUserResponse, RoomserverError> {
        let room_ids = self
            .db
            .memberships_for_user(&req.user_id)
            .await?
            .into_iter()
            .filter(|r| req.membership.is_none_or(|m| r.membership == m))
            .map(|r| r.room_id)
            .collect();
        Ok(QueryRoomsForUserResponse {
            room_ids,
            ..Default::default()
        })
    }

    pub async fn query_room_version(
        &self,
        req: &QueryRoomVersionRequest,
    ) -> Result<QueryRoomVersionResponse, RoomserverError> {
        let room = self.room(&req.room_id).await?;
        Ok(QueryRoomVersionResponse {
            room_version: Some(room.version),
            ..Default::default()
        })
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub async fn query_events_by_id(
        &self,
        req: &QueryEventsByIdRequest,
    ) -> Result<QueryEventsByIdResponse, RoomserverError> {
        let events = self
            .db
            .events(&req.event_ids)
            .await?
            .into_iter()
            .filter(|s| !s.is_rejected())
            .map(|s| s.event)
            .collect();
        Ok(QueryEventsByIdResponse {
            events,
            ..Default::default()
        })
    }

    pub async fn query_auth_chain(
        &self,
        req: &QueryAuthChainRequest,
    ) -> Result<QueryAuthChainResponse, RoomserverError> {
        let start = self.db.events(&req.event_ids).await?;
        let seeds: Vec<&Event> = start.iter().map(|s| &s.event).collect();
        Ok(QueryAuthChainResponse {
            auth_chain: self.auth_chain(&seeds).await?,
            ..Default::default()
        })
    }

    /// Events between `earliest` and `latest`, walking prev events back from
    /// `latest`. Oldest first.
    pub async fn query_missing_events(
        &self,
        req: &QueryMissingEventsRequest,
    ) -> Result<QueryEventsResponse, RoomserverError> {
        self.room(&req.room_id).await?;
        let stop: HashSet<&EventId> = req.earliest.iter().collect();
        let mut seen: HashSet<EventId> = req.latest.iter().cloned().collect();
        let mut queue: VecDeque<EventId> = VecDeque::new();
        for latest in self.db.events(&req.latest).await? {
            queue.extend(latest.event.prev_events().iter().cloned());
        }

        let mut found = Vec::new();
        while let Some(id) = queue.pop_front() {
            if found.len() >= req.limit {
                break;
            }
            if stop.contains(&id) || !seen.insert(id.clone()) {
                continue;
            }
            let Some(stored) = self.db.event(&id).await? else {
                continue;
            };
            if stored.event.room_id() != &req.room_id || stored.is_rejected() {
                continue;
            }
            queue.extend(stored.event.prev_events().iter().cloned());
            found.push(stored.event);
        }
        Ok(QueryEventsResponse {
            events: oldest_first(found),
            ..Default::default()
        })
    }

    /// Local walk back from `from`, including `from` itself. Newest first.
    pub async fn query_backfill(
        &self,
        req: &QueryBackfillRequest,
    ) -> Result<QueryEventsResponse, RoomserverError> {
        self.room(&req.room_id).await?;
        let limit = req.limit.min(self.max_backfill);
        let mut seen: HashSet<EventId> = HashSet::new();
        let mut queue: VecDeque<EventId> = req.from.iter().cloned().collect();

        let mut found = Vec::new();
        while let Some(id) = queue.pop_front() {
            if found.len() >= limit {
                break;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(stored) = self.db.event(&id).await? else {
                continue;
            };
            if stored.event.room_id() != &req.room_id
                || stored.is_rejected()
                || stored.is_outlier()
            {
                continue;
            }
            queue.extend(stored.event.prev_events().iter().cloned());
            found.push(stored.event);
        }
        let mut events = oldest_first(found);
        events.reverse();
        Ok(QueryEventsResponse {
            events,
            ..Default::default()
        })
    }

    pub async fn query_output_log(
        &self,
        req: &QueryOutputLogRequest,
    ) -> Result<QueryOutputLogResponse, RoomserverError> {
        Ok(QueryOutputLogResponse {
            records: self.db.output_since(&req.room_id, req.since, req.limit).await?,
            ..Default::default()
        })
    }

    // ========================================================================
    // Servers
    // ========================================================================

    pub async fn query_server_allowed(
        &self,
        req: &QueryServerAllowedRequest,
    ) -> Result<QueryServerAllowedResponse, RoomserverError> {
        Ok(QueryServerAllowedResponse {
            allowed: !self
                .acls
                .is_server_banned_from_room(&req.server_name, &req.room_id)
                .await,
            ..Default::default()
        })
    }

    pub async fn query_server_joined_to_room(
        &self,
        req: &QueryServerJoinedToRoomRequest,
    ) -> Result<QueryServerJoinedToRoomResponse, RoomserverError> {
        if self.db.room(&req.room_id).await?.is_none() {
            return Ok(QueryServerJoinedToRoomResponse::default());
        }
        let joined = self.joined_servers(&req.room_id).await?;
        Ok(QueryServerJoinedToRoomResponse {
            room_exists: true,
            is_joined: joined.contains(&req.server_name),
            ..Default::default()
        })
    }

    pub async fn query_published_rooms(
        &self,
    ) -> Result<QueryPublishedRoomsResponse, RoomserverError> {
        Ok(QueryPublishedRoomsResponse {
            room_ids: self.db.published_rooms().await?,
            ..Default::default()
        })
    }

    // ========================================================================
    // Helpers shared with the performers and inbound federation
    // ========================================================================

    pub(crate) async fn room(&self, room_id: &RoomId) -> Result<RoomRecord, RoomserverError> {
        self.db
            .room(room_id)
            .await?
            .ok_or_else(|| RoomserverError::UnknownRoom(room_id.clone()))
    }

    pub(crate) async fn current_state(
        &self,
        room_id: &RoomId,
    ) -> Result<StateSnapshot, RoomserverError> {
        let room = self.room(room_id).await?;
        self.snapshot(&room.current_state).await
    }

    pub(crate) async fn snapshot(&self, id: &SnapshotId) -> Result<StateSnapshot, RoomserverError> {
        self.db
            .snapshot(id)
            .await?
            .ok_or_else(|| RoomserverError::StateUnavailable(format!("snapshot {id}")))
    }

    pub(crate) async fn stored(&self, event_id: &EventId) -> Result<StoredEvent, RoomserverError> {
        self.db
            .event(event_id)
            .await?
            .ok_or_else(|| RoomserverError::BadRequest(format!("unknown event {event_id}")))
    }

    pub(crate) async fn state_before(
        &self,
        stored: &StoredEvent,
    ) -> Result<StateSnapshot, RoomserverError> {
        let id = stored.state_before.as_ref().ok_or_else(|| {
            RoomserverError::StateUnavailable(format!("no state before {}", stored.event_id()))
        })?;
        self.snapshot(id).await
    }

    /// Events of `snapshot` for `tuples`, or all of them when `tuples` is empty.
    pub(crate) async fn state_events(
        &self,
        snapshot: &StateSnapshot,
        tuples: &[StateKeyTuple],
    ) -> Result<Vec<Event>, RoomserverError> {
        let ids = snapshot.event_ids(tuples);
        let stored = self.db.events(&ids).await?;
        if stored.len() != ids.len() {
            return Err(RoomserverError::StateUnavailable(
                "state references events that are not stored".into(),
            ));
        }
        Ok(stored.into_iter().map(|s| s.event).collect())
    }

    /// Full auth chain of `events`, excluding the events themselves. Oldest
    /// first.
    pub(crate) async fn auth_chain(&self, events: &[&Event]) -> Result<Vec<Event>, RoomserverError> {
        let start: HashSet<&EventId> = events.iter().map(|e| e.event_id()).collect();
        let mut seen: HashSet<EventId> = HashSet::new();
        let mut queue: VecDeque<EventId> = events
            .iter()
            .flat_map(|e| e.auth_events().iter().cloned())
            .collect();

        let mut chain = Vec::new();
        while let Some(id) = queue.pop_front() {
            if start.contains(&id) || !seen.insert(id.clone()) {
                continue;
            }
            let Some(stored) = self.db.event(&id).await? else {
                continue;
            };
            queue.extend(stored.event.auth_events().iter().cloned());
            chain.push(stored.event);
        }
        Ok(oldest_first(chain))
    }

    async fn member_events(&self, snapshot: &StateSnapshot) -> Result<Vec<Event>, RoomserverError> {
        let ids: Vec<EventId> = snapshot
            .state()
            .iter()
            .filter(|(tuple, _)| tuple.event_type == event_type::MEMBER)
            .map(|(_, id)| id.clone())
            .collect();
        Ok(self
            .db
            .events(&ids)
            .await?
            .into_iter()
            .map(|s| s.event)
            .collect())
    }

    /// Servers with at least one joined user in current state, sorted.
    pub(crate) async fn joined_servers(
        &self,
        room_id: &RoomId,
    ) -> Result<BTreeSet<ServerName>, RoomserverError> {
        let current = self.current_state(room_id).await?;
        Ok(self
            .member_events(&current)
            .await?
            .iter()
            .filter(|e| matches!(e.membership(), Ok(Some(Membership::Join))))
            .filter_map(|e| e.state_key().and_then(|k| UserId::parse(k).ok()))
            .map(|user| user.server_name())
            .collect())
    }

    /// Whether the room's current history visibility is `world_readable`.
    pub(crate) async fn is_world_readable(&self, room_id: &RoomId) -> Result<bool, RoomserverError> {
        let current = self.current_state(room_id).await?;
        let tuple = StateKeyTuple::room(event_type::HISTORY_VISIBILITY);
        let Some(id) = current.get(&tuple) else {
            return Ok(false);
        };
        Ok(self.db.event(id).await?.is_some_and(|s| {
            HistoryVisibilityContent::from_value(s.event.content())
                .is_ok_and(|c| c.history_visibility == HistoryVisibility::WorldReadable)
        }))
    }

    /// The forward extremity with the greatest depth, ties broken by id.
    pub(crate) async fn latest_event(&self, room: &RoomRecord) -> Result<StoredEvent, RoomserverError> {
        self.db
            .events(&room.forward_extremities)
            .await?
            .into_iter()
            .max_by(|a, b| {
                a.event
                    .depth()
                    .cmp(&b.event.depth())
                    .then_with(|| a.event_id().cmp(b.event_id()))
            })
            .ok_or_else(|| {
                RoomserverError::StateUnavailable(format!("no extremities for {}", room.room_id))
            })
    }
}

/// Sort by depth, ties broken by id.
fn oldest_first(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by(|a, b| {
        a.depth()
            .cmp(&b.depth())
            .then_with(|| a.event_id().cmp(b.event_id()))
    });
    events
}
