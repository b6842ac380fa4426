//! Query requests and responses.

use super::api_response;
use crate::error::PerformError;
use crate::output::OutputRecord;
use serde::{Deserialize, Serialize};
use slroom_proto::{Event, EventId, Membership, RoomId, RoomVersion, ServerName, StateKeyTuple, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCurrentStateRequest {
    pub room_id: RoomId,
    /// Restrict to these tuples; empty means all state.
    #[serde(default)]
    pub tuples: Vec<StateKeyTuple>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryCurrentStateResponse {
    pub state_events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStateEventRequest {
    pub room_id: RoomId,
    pub event_type: String,
    pub state_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStateEventResponse {
    pub event: Option<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStateAfterEventRequest {
    pub event_id: EventId,
    #[serde(default)]
    pub tuples: Vec<StateKeyTuple>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStateBeforeEventRequest {
    pub event_id: EventId,
}

/// State at an event, before or after it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStateAtEventResponse {
    pub state_events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLatestEventsAndStateRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub tuples: Vec<StateKeyTuple>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryLatestEventsAndStateResponse {
    pub room_exists: bool,
    pub room_version: Option<RoomVersion>,
    pub latest_event_ids: Vec<EventId>,
    pub depth: u64,
    pub state_events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMembersRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub joined_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMembersResponse {
    pub members: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMembershipForUserRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMembershipForUserResponse {
    pub membership: Option<Membership>,
    pub event_id: Option<EventId>,
    pub is_in_room: bool,
    pub has_been_in_room: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRoomsForUserRequest {
    pub user_id: UserId,
    /// Only rooms where the user has this membership; `None` for any.
    #[serde(default)]
    pub membership: Option<Membership>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRoomsForUserResponse {
    pub room_ids: Vec<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRoomVersionRequest {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRoomVersionResponse {
    pub room_version: Option<RoomVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventsByIdRequest {
    pub event_ids: Vec<EventId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryEventsByIdResponse {
    /// Known, non-rejected events in request order.
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAuthChainRequest {
    pub event_ids: Vec<EventId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryAuthChainResponse {
    /// Oldest first.
    pub auth_chain: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryServerAllowedRequest {
    pub room_id: RoomId,
    pub server_name: ServerName,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryServerAllowedResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryServerJoinedToRoomRequest {
    pub room_id: RoomId,
    pub server_name: ServerName,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryServerJoinedToRoomResponse {
    pub room_exists: bool,
    pub is_joined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPublishedRoomsResponse {
    pub room_ids: Vec<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMissingEventsRequest {
    pub room_id: RoomId,
    pub earliest: Vec<EventId>,
    pub latest: Vec<EventId>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryBackfillRequest {
    pub room_id: RoomId,
    pub from: Vec<EventId>,
    pub limit: usize,
}

/// A list of timeline events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryEventsResponse {
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutputLogRequest {
    pub room_id: RoomId,
    /// Return records with a sequence number greater than this.
    #[serde(default)]
    pub since: u64,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOutputLogResponse {
    pub records: Vec<OutputRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

api_response!(
    QueryCurrentStateResponse,
    QueryStateEventResponse,
    QueryStateAtEventResponse,
    QueryLatestEventsAndStateResponse,
    QueryMembersResponse,
    QueryMembershipForUserResponse,
    QueryRoomsForUserResponse,
    QueryRoomVersionResponse,
    QueryEventsByIdResponse,
    QueryAuthChainResponse,
    QueryServerAllowedResponse,
    QueryServerJoinedToRoomResponse,
    QueryPublishedRoomsResponse,
    QueryEventsResponse,
    QueryOutputLogResponse,
);
