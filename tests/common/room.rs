//! Writing room events in tests.
//!
//! Events are built the way a client-facing server would: on top of the
//! target server's forward extremities, citing auth events from its current
//! state.

use serde_json::{Value, json};
use slroom_proto::{Event, EventBuilder, EventId, RoomId, UserId, event_type};
use slroomd::Roomserver;
use slroomd::api::{ApiResponse, InputRoomEventsResponse, QueryLatestEventsAndStateRequest};
use slroomd::auth::auth_types_for;
use slroomd::context::RequestContext;
use slroomd::input::InputKind;
use std::sync::atomic::{AtomicI64, Ordering};

static CLOCK: AtomicI64 = AtomicI64::new(1_700_000_000_000);

/// Distinct, increasing timestamps so identical content never collides.
pub fn tick() -> i64 {
    CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// A room created on one server.
#[derive(Debug, Clone)]
pub struct TestRoom {
    pub room_id: RoomId,
    pub creator: UserId,
}

#[allow(dead_code)]
impl TestRoom {
    /// Create a public room: create, creator join, power levels, public join
    /// rule, shared history.
    pub async fn create(server: &Roomserver, room_id: RoomId, creator: UserId) -> anyhow::Result<Self> {
        let room = Self { room_id, creator };
        let creator = room.creator.clone();
        room.send(server, &creator, event_type::CREATE, Some(""), json!({"room_version": "10"}))
            .await?;
        room.send(
            server,
            &creator,
            event_type::MEMBER,
            Some(creator.as_str()),
            json!({"membership": "join"}),
        )
        .await?;
        room.send(
            server,
            &creator,
            event_type::POWER_LEVELS,
            Some(""),
            json!({"users": {creator.as_str(): 100}, "users_default": 0}),
        )
        .await?;
        room.send(server, &creator, event_type::JOIN_RULES, Some(""), json!({"join_rule": "public"}))
            .await?;
        room.send(
            server,
            &creator,
            event_type::HISTORY_VISIBILITY,
            Some(""),
            json!({"history_visibility": "shared"}),
        )
        .await?;
        Ok(room)
    }

    pub async fn set_world_readable(&self, server: &Roomserver) -> anyhow::Result<EventId> {
        let creator = self.creator.clone();
        self.send(
            server,
            &creator,
            event_type::HISTORY_VISIBILITY,
            Some(""),
            json!({"history_visibility": "world_readable"}),
        )
        .await
    }

    /// Build an event on top of `server`'s view of the room.
    pub async fn build(
        &self,
        server: &Roomserver,
        sender: &UserId,
        ty: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> Event {
        let mut builder = EventBuilder::new(self.room_id.clone(), sender.clone(), ty, content.clone())
            .origin_server_ts(tick());
        if let Some(key) = state_key {
            builder = builder.state_key(key);
        }

        let tuples = auth_types_for(ty, state_key, sender, &content);
        if !tuples.is_empty() {
            let latest = server
                .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
                    room_id: self.room_id.clone(),
                    tuples: tuples.clone(),
                })
                .await;
            if latest.room_exists {
                let auth_events = latest
                    .state_events
                    .iter()
                    .filter(|e| e.state_key_tuple().is_some_and(|t| tuples.contains(&t)))
                    .map(|e| e.event_id().clone())
                    .collect();
                builder = builder
                    .prev_events(latest.latest_event_ids)
                    .auth_events(auth_events)
                    .depth(latest.depth + 1);
            }
        }
        builder.build()
    }

    /// Build and submit as a live event.
    pub async fn try_send(
        &self,
        server: &Roomserver,
        sender: &UserId,
        ty: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> (Event, InputRoomEventsResponse) {
        let event = self.build(server, sender, ty, state_key, content).await;
        let response = server
            .input_event(&RequestContext::new(), InputKind::New, event.clone())
            .await;
        (event, response)
    }

    /// Build and submit, failing the test if the event is not accepted.
    pub async fn send(
        &self,
        server: &Roomserver,
        sender: &UserId,
        ty: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> anyhow::Result<EventId> {
        let (event, response) = self.try_send(server, sender, ty, state_key, content).await;
        response
            .into_result()
            .map_err(|e| anyhow::anyhow!("{} not accepted: {}", event.event_id(), e.msg))?;
        Ok(event.event_id().clone())
    }

    pub async fn message(&self, server: &Roomserver, sender: &UserId, body: &str) -> anyhow::Result<EventId> {
        self.send(server, sender, event_type::MESSAGE, None, json!({"body": body}))
            .await
    }

    /// Join `user` directly by submitting a join event (no performer).
    pub async fn join(&self, server: &Roomserver, user: &UserId) -> anyhow::Result<EventId> {
        self.send(
            server,
            user,
            event_type::MEMBER,
            Some(user.as_str()),
            json!({"membership": "join"}),
        )
        .await
    }
}
