//! Building events on top of current state.

use super::{Performers, now_ms};
use crate::auth::{AuthEventSet, auth_types_for, is_authorized};
use crate::error::RoomserverError;
use crate::federation::EventTemplate;
use serde_json::Value;
use slroom_proto::{Event, RoomId, RoomVersion, UserId};

impl Performers {
    /// A template for an event by `sender` that extends the room's forward
    /// extremities and cites its auth events from current state.
    pub(crate) async fn template(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> Result<(RoomVersion, EventTemplate), RoomserverError> {
        let room = self.queryer.room(room_id).await?;
        let current = self.queryer.snapshot(&room.current_state).await?;
        let tuples = auth_types_for(event_type, state_key, sender, &content);
        let auth_events = if tuples.is_empty() {
            Vec::new()
        } else {
            current.event_ids(&tuples)
        };
        let template = EventTemplate {
            room_id: room_id.clone(),
            sender: sender.clone(),
            event_type: event_type.to_string(),
            state_key: state_key.map(str::to_string),
            content,
            prev_events: room.forward_extremities,
            auth_events,
            depth: room.depth + 1,
        };
        Ok((room.version, template))
    }

    /// Build an event from this server and check it against its own auth
    /// events before anything is sent anywhere.
    pub(crate) async fn build_event(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> Result<(RoomVersion, Event), RoomserverError> {
        let (version, template) = self
            .template(room_id, sender, event_type, state_key, content)
            .await?;
        let event = template.into_event(self.local.clone(), now_ms());

        let auth = self.db.events(event.auth_events()).await?;
        let provider = AuthEventSet::from_events(auth.iter().map(|s| &s.event));
        is_authorized(&event, &provider)
            .map_err(|err| RoomserverError::unauthorized(event.event_id(), &err))?;
        Ok((version, event))
    }
}
