//! Federation for a server with no peers.

use super::{
    FederationApi, FederationError, MakeJoinResponse, MakeLeaveResponse, PeekResponse,
    SendJoinResponse,
};
use async_trait::async_trait;
use slroom_proto::{Event, EventId, RoomId, RoomVersion, ServerName, UserId};

/// Fails every call with [`FederationError::Unreachable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFederation;

#[async_trait]
impl FederationApi for NoFederation {
    async fn get_event(&self, destination: &ServerName, _: &EventId) -> Result<Event, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn get_missing_events(
        &self,
        destination: &ServerName,
        _: &RoomId,
        _: &[EventId],
        _: &[EventId],
        _: usize,
    ) -> Result<Vec<Event>, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn event_auth(
        &self,
        destination: &ServerName,
        _: &RoomId,
        _: &EventId,
    ) -> Result<Vec<Event>, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn make_join(
        &self,
        destination: &ServerName,
        _: &RoomId,
        _: &UserId,
    ) -> Result<MakeJoinResponse, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn send_join(&self, destination: &ServerName, _: Event) -> Result<SendJoinResponse, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn make_leave(
        &self,
        destination: &ServerName,
        _: &RoomId,
        _: &UserId,
    ) -> Result<MakeLeaveResponse, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn send_leave(&self, destination: &ServerName, _: Event) -> Result<(), FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn send_invite(
        &self,
        destination: &ServerName,
        _: RoomVersion,
        _: Event,
    ) -> Result<Event, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn peek(&self, destination: &ServerName, _: &RoomId, _: &str) -> Result<PeekResponse, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }

    async fn backfill(
        &self,
        destination: &ServerName,
        _: &RoomId,
        _: &[EventId],
        _: usize,
    ) -> Result<Vec<Event>, FederationError> {
        Err(FederationError::Unreachable(destination.clone()))
    }
}
