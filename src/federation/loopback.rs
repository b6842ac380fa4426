//! In-process federation.
//!
//! Every [`Roomserver`] registered on a [`LoopbackNetwork`] can reach the
//! others by name. Calls go straight to the destination's inbound handlers,
//! with the caller's server name as origin so ACLs apply as they would over a
//! real transport.

use super::{
    FederationApi, FederationError, MakeJoinResponse, MakeLeaveResponse, PeekResponse,
    SendJoinResponse,
};
use crate::roomserver::Roomserver;
use crate::telemetry::spans;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use slroom_proto::{Event, EventId, RoomId, RoomVersion, ServerName, UserId};
use std::sync::{Arc, Weak};
use tracing::Instrument;

/// Registry of the servers hosted in this process.
#[derive(Default)]
pub struct LoopbackNetwork {
    servers: DashMap<ServerName, Weak<Roomserver>>,
    offline: DashSet<ServerName>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `server` reachable under its configured name.
    pub fn register(&self, server: &Arc<Roomserver>) {
        self.servers
            .insert(server.server_name().clone(), Arc::downgrade(server));
    }

    /// A federation client that calls out as `origin`.
    pub fn client(self: &Arc<Self>, origin: ServerName) -> Arc<LoopbackFederation> {
        Arc::new(LoopbackFederation {
            origin,
            network: Arc::clone(self),
        })
    }

    /// Simulate an outage: calls to `server` fail as unreachable until it is
    /// brought back with [`LoopbackNetwork::set_online`].
    pub fn set_offline(&self, server: &ServerName) {
        self.offline.insert(server.clone());
    }

    pub fn set_online(&self, server: &ServerName) {
        self.offline.remove(server);
    }

    fn resolve(&self, destination: &ServerName) -> Result<Arc<Roomserver>, FederationError> {
        if self.offline.contains(destination) {
            return Err(FederationError::Unreachable(destination.clone()));
        }
        self.servers
            .get(destination)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| FederationError::Unreachable(destination.clone()))
    }
}

/// [`FederationApi`] over a [`LoopbackNetwork`].
pub struct LoopbackFederation {
    origin: ServerName,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl FederationApi for LoopbackFederation {
    async fn get_event(
        &self,
        destination: &ServerName,
        event_id: &EventId,
    ) -> Result<Event, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_get_event(&self.origin, event_id)
            .instrument(spans::federation("get_event", destination))
            .await
    }

    async fn get_missing_events(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        earliest: &[EventId],
        latest: &[EventId],
        limit: usize,
    ) -> Result<Vec<Event>, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_get_missing_events(&self.origin, room_id, earliest, latest, limit)
            .instrument(spans::federation("get_missing_events", destination))
            .await
    }

    async fn event_auth(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Vec<Event>, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_event_auth(&self.origin, room_id, event_id)
            .instrument(spans::federation("event_auth", destination))
            .await
    }

    async fn make_join(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<MakeJoinResponse, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_make_join(&self.origin, room_id, user_id)
            .instrument(spans::federation("make_join", destination))
            .await
    }

    async fn send_join(
        &self,
        destination: &ServerName,
        event: Event,
    ) -> Result<SendJoinResponse, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_send_join(&self.origin, event)
            .instrument(spans::federation("send_join", destination))
            .await
    }

    async fn make_leave(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<MakeLeaveResponse, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_make_leave(&self.origin, room_id, user_id)
            .instrument(spans::federation("make_leave", destination))
            .await
    }

    async fn send_leave(
        &self,
        destination: &ServerName,
        event: Event,
    ) -> Result<(), FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_send_leave(&self.origin, event)
            .instrument(spans::federation("send_leave", destination))
            .await
    }

    async fn send_invite(
        &self,
        destination: &ServerName,
        room_version: RoomVersion,
        event: Event,
    ) -> Result<Event, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_invite(&self.origin, room_version, event)
            .instrument(spans::federation("send_invite", destination))
            .await
    }

    async fn peek(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        peek_id: &str,
    ) -> Result<PeekResponse, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_peek(&self.origin, room_id, peek_id)
            .instrument(spans::federation("peek", destination))
            .await
    }

    async fn backfill(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        from: &[EventId],
        limit: usize,
    ) -> Result<Vec<Event>, FederationError> {
        let server = self.network.resolve(destination)?;
        server
            .serve_backfill(&self.origin, room_id, from, limit)
            .instrument(spans::federation("backfill", destination))
            .await
    }
}
