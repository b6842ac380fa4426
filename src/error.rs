//! Unified error handling for slroomd.
//!
//! Every layer has its own `thiserror` enum. They all funnel into
//! [`RoomserverError`], whose [`ErrorKind`] is the explicit error kind that
//! API responses carry and whose [`RoomserverError::error_code`] labels
//! metrics.

use crate::auth::AuthError;
use crate::federation::FederationError;
use crate::resolution::ResolutionError;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use slroom_proto::{EventId, RoomId, UnsupportedRoomVersion};
use thiserror::Error;

// ============================================================================
// Error kinds
// ============================================================================

/// Explicit error kind reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ForbiddenOrigin,
    Unauthorized,
    MissingPrevState,
    MissingAuthEvent,
    StateUnavailable,
    RemoteNegotiationFailed,
    StillJoined,
    UnknownRoom,
    NotInRoom,
    BadRequest,
    UnsupportedRoomVersion,
    NotAttached,
    Cancelled,
    Storage,
    Internal,
}

// ============================================================================
// Roomserver Errors
// ============================================================================

/// Errors returned by the input pipeline, queries and performers.
#[derive(Debug, Clone, Error)]
pub enum RoomserverError {
    #[error("server {server} is denied by the ACL of {room_id}")]
    ForbiddenOrigin { server: String, room_id: RoomId },

    #[error("event is not authorized: {reason}")]
    Unauthorized { event_id: Option<EventId>, reason: String },

    #[error("state before {event_id} is unavailable: missing prev events {missing:?}")]
    MissingPrevState { event_id: EventId, missing: Vec<EventId> },

    #[error("missing auth events {missing:?}")]
    MissingAuthEvent { missing: Vec<EventId> },

    #[error("state snapshot unavailable: {0}")]
    StateUnavailable(String),

    #[error("remote negotiation failed: {0}")]
    RemoteNegotiationFailed(String),

    #[error("user is still joined to {0}")]
    StillJoined(RoomId),

    #[error("unknown room {0}")]
    UnknownRoom(RoomId),

    #[error("user is not in room {0}")]
    NotInRoom(RoomId),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    UnsupportedRoomVersion(#[from] UnsupportedRoomVersion),

    #[error("federation has not been attached")]
    NotAttached,

    #[error("request cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RoomserverError {
    /// The explicit error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ForbiddenOrigin { .. } => ErrorKind::ForbiddenOrigin,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::MissingPrevState { .. } => ErrorKind::MissingPrevState,
            Self::MissingAuthEvent { .. } => ErrorKind::MissingAuthEvent,
            Self::StateUnavailable(_) => ErrorKind::StateUnavailable,
            Self::RemoteNegotiationFailed(_) => ErrorKind::RemoteNegotiationFailed,
            Self::StillJoined(_) => ErrorKind::StillJoined,
            Self::UnknownRoom(_) => ErrorKind::UnknownRoom,
            Self::NotInRoom(_) => ErrorKind::NotInRoom,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::UnsupportedRoomVersion(_) => ErrorKind::UnsupportedRoomVersion,
            Self::NotAttached => ErrorKind::NotAttached,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ForbiddenOrigin => "forbidden_origin",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::MissingPrevState => "missing_prev_state",
            ErrorKind::MissingAuthEvent => "missing_auth_event",
            ErrorKind::StateUnavailable => "state_unavailable",
            ErrorKind::RemoteNegotiationFailed => "remote_negotiation_failed",
            ErrorKind::StillJoined => "still_joined",
            ErrorKind::UnknownRoom => "unknown_room",
            ErrorKind::NotInRoom => "not_in_room",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::UnsupportedRoomVersion => "unsupported_room_version",
            ErrorKind::NotAttached => "not_attached",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage_error",
            ErrorKind::Internal => "internal_error",
        }
    }

    pub(crate) fn unauthorized(event_id: &EventId, err: &AuthError) -> Self {
        Self::Unauthorized {
            event_id: Some(event_id.clone()),
            reason: err.to_string(),
        }
    }
}

impl From<StorageError> for RoomserverError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<ResolutionError> for RoomserverError {
    fn from(err: ResolutionError) -> Self {
        match err {
            ResolutionError::MissingEvents(missing) => Self::MissingAuthEvent { missing },
        }
    }
}

impl From<FederationError> for RoomserverError {
    fn from(err: FederationError) -> Self {
        Self::RemoteNegotiationFailed(err.to_string())
    }
}

/// Serializable error attached to API responses.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {msg}")]
pub struct PerformError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl From<&RoomserverError> for PerformError {
    fn from(err: &RoomserverError) -> Self {
        Self {
            kind: err.kind(),
            msg: err.to_string(),
        }
    }
}
