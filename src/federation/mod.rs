//! Federation collaborator.
//!
//! The roomserver never speaks a wire protocol itself. Everything it needs
//! from other servers goes through [`FederationApi`]; transports live behind
//! that trait.
//!
//! - [`NoFederation`]: single-server deployments, every call fails
//! - [`LoopbackNetwork`]: servers hosted in one process call each other directly

mod loopback;
mod noop;
mod serve;

pub use loopback::{LoopbackFederation, LoopbackNetwork};
pub use noop::NoFederation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slroom_proto::{Event, EventBuilder, EventId, RoomId, RoomVersion, ServerName, UserId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FederationError {
    #[error("server {0} is unreachable")]
    Unreachable(ServerName),
    #[error("server {server} refused the request: {reason}")]
    Refused { server: ServerName, reason: String },
    #[error("{what} not found on {server}")]
    NotFound { server: ServerName, what: String },
}

impl FederationError {
    /// Whether retrying the same server may help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// An event prepared by a resident server, to be completed and sent back by
/// the server whose user it is for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub room_id: RoomId,
    pub sender: UserId,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: Value,
    pub prev_events: Vec<EventId>,
    pub auth_events: Vec<EventId>,
    pub depth: u64,
}

impl EventTemplate {
    /// Finish the template as an event from `origin` at `origin_server_ts`.
    pub fn into_event(self, origin: ServerName, origin_server_ts: i64) -> Event {
        let mut builder = EventBuilder::new(self.room_id, self.sender, self.event_type, self.content)
            .prev_events(self.prev_events)
            .auth_events(self.auth_events)
            .depth(self.depth)
            .origin(origin)
            .origin_server_ts(origin_server_ts);
        if let Some(state_key) = self.state_key {
            builder = builder.state_key(state_key);
        }
        builder.build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeJoinResponse {
    pub room_version: RoomVersion,
    pub template: EventTemplate,
}

/// State before the join event plus the auth chain of that state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendJoinResponse {
    pub state_events: Vec<Event>,
    pub auth_chain: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeLeaveResponse {
    pub room_version: RoomVersion,
    pub template: EventTemplate,
}

/// What a resident server hands to a peeking server: the state before
/// `latest_event` and its auth chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeekResponse {
    pub room_version: RoomVersion,
    pub state_events: Vec<Event>,
    pub auth_chain: Vec<Event>,
    pub latest_event: Event,
    pub renewal_interval_ms: u64,
}

/// Calls the roomserver makes to other servers.
#[async_trait]
pub trait FederationApi: Send + Sync {
    async fn get_event(
        &self,
        destination: &ServerName,
        event_id: &EventId,
    ) -> Result<Event, FederationError>;

    /// Events between `earliest` and `latest`, oldest first.
    async fn get_missing_events(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        earliest: &[EventId],
        latest: &[EventId],
        limit: usize,
    ) -> Result<Vec<Event>, FederationError>;

    /// Full auth chain of `event_id`.
    async fn event_auth(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Vec<Event>, FederationError>;

    async fn make_join(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<MakeJoinResponse, FederationError>;

    async fn send_join(
        &self,
        destination: &ServerName,
        event: Event,
    ) -> Result<SendJoinResponse, FederationError>;

    async fn make_leave(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<MakeLeaveResponse, FederationError>;

    async fn send_leave(&self, destination: &ServerName, event: Event)
    -> Result<(), FederationError>;

    /// Deliver an invite; the invitee's server returns it countersigned.
    async fn send_invite(
        &self,
        destination: &ServerName,
        room_version: RoomVersion,
        event: Event,
    ) -> Result<Event, FederationError>;

    async fn peek(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        peek_id: &str,
    ) -> Result<PeekResponse, FederationError>;

    /// Events preceding `from`, newest first.
    async fn backfill(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        from: &[EventId],
        limit: usize,
    ) -> Result<Vec<Event>, FederationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use slroom_proto::event_type;

    #[test]
    fn template_completes_into_valid_event() {
        let template = EventTemplate {
            room_id: RoomId::parse("!r:a.example").unwrap(),
            sender: UserId::parse("@bob:b.example").unwrap(),
            event_type: event_type::MEMBER.into(),
            state_key: Some("@bob:b.example".into()),
            content: json!({"membership": "join"}),
            prev_events: vec![EventId::parse("$prev").unwrap()],
            auth_events: vec![EventId::parse("$create").unwrap()],
            depth: 4,
        };
        let event = template.into_event(ServerName::parse("b.example").unwrap(), 1_000);
        assert!(event.verify_id());
        assert_eq!(event.depth(), 4);
        assert_eq!(event.origin().as_str(), "b.example");
        assert_eq!(event.state_key(), Some("@bob:b.example"));
    }

    #[test]
    fn only_unreachable_is_transient() {
        let server = ServerName::parse("b.example").unwrap();
        assert!(FederationError::Unreachable(server.clone()).is_transient());
        assert!(
            !FederationError::NotFound {
                server,
                what: "event".into()
            }
            .is_transient()
        );
    }
}
