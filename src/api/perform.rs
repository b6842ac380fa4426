//! Performer requests and responses.

use super::api_response;
use crate::error::PerformError;
use serde::{Deserialize, Serialize};
use slroom_proto::{Event, EventId, RoomId, RoomVersion, ServerName, UserId};

// ============================================================================
// Invite
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformInviteRequest {
    pub room_id: RoomId,
    /// Local user sending the invite.
    pub sender: UserId,
    pub invitee: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformInviteResponse {
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

// ============================================================================
// Join
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformJoinRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
    /// Servers to try for a remote join, before the room id's own server.
    #[serde(default)]
    pub server_names: Vec<ServerName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformJoinResponse {
    pub event_id: Option<EventId>,
    /// Resident server the join went through, for remote joins.
    pub joined_via: Option<ServerName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

// ============================================================================
// Leave / forget
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformLeaveRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformLeaveResponse {
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformForgetRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformForgetResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

// ============================================================================
// Peeking
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformPeekRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub device_id: String,
    /// Servers to peek through when the room is not known locally.
    #[serde(default)]
    pub server_names: Vec<ServerName>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformPeekResponse {
    pub room_id: Option<RoomId>,
    /// Resident server the peek went through, for remote peeks.
    pub peeked_via: Option<ServerName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformUnpeekRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub device_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformUnpeekResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformInboundPeekRequest {
    pub room_id: RoomId,
    /// Server asking to peek.
    pub server_name: ServerName,
    pub peek_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformInboundPeekResponse {
    pub room_exists: bool,
    pub room_version: Option<RoomVersion>,
    /// State before `latest_event`.
    pub state_events: Vec<Event>,
    pub auth_chain: Vec<Event>,
    pub latest_event: Option<Event>,
    pub renewal_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

// ============================================================================
// Publishing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformPublishRequest {
    pub room_id: RoomId,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformPublishResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

// ============================================================================
// Backfill
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformBackfillRequest {
    pub room_id: RoomId,
    /// Walk backwards from these events.
    pub from: Vec<EventId>,
    pub limit: usize,
    /// Server the request came from. Only requests from the local server
    /// may reach out to other servers.
    pub server_name: ServerName,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformBackfillResponse {
    /// Newest first.
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

api_response!(
    PerformInviteResponse,
    PerformJoinResponse,
    PerformLeaveResponse,
    PerformForgetResponse,
    PerformPeekResponse,
    PerformUnpeekResponse,
    PerformInboundPeekResponse,
    PerformPublishResponse,
    PerformBackfillResponse,
);
