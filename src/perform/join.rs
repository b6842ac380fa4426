//! Joining rooms.
//!
//! ## State Machine
//!
//! ```text
//! ┌───────────┐  remote  ┌───────────────────┐  send_join  ┌────────────────┐  accepted  ┌────────┐
//! │ NotJoined ├─────────►│ NegotiatingRemote ├────────────►│ EventSubmitted ├───────────►│ Joined │
//! └─────┬─────┘          └─────────┬─────────┘             └───────┬────────┘            └────────┘
//!       │         local join       │ no server agreed              │ not authorized
//!       └──────────────────────────┼──────────────►────────────────┤
//!                                  │                               ▼
//!                                  │                          ┌──────────┐
//!                                  └─────────────────────────►│ Rejected │
//!                                                             └──────────┘
//! ```
//!
//! A join is local when a local user is already joined to the room;
//! otherwise it goes through `make_join`/`send_join` with a resident server
//! and the returned state is stored as outliers before the join itself.

use super::{Performers, now_ms};
use crate::api::{PerformJoinRequest, PerformJoinResponse};
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::input::{InputKind, InputRoomEvent};
use slroom_proto::{
    EventId, MemberContent, Membership, RoomId, RoomVersion, ServerName, UserId, event_type,
};
use std::marker::PhantomData;
use tracing::{debug, info, warn};

// ============================================================================
// State Marker Types (Zero-Sized)
// ============================================================================

/// Nothing has happened yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotJoined;

/// Talking to resident servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiatingRemote;

/// The join event exists and is going through the input pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSubmitted;

#[derive(Debug, Clone, Copy, Default)]
pub struct Joined;

#[derive(Debug, Clone, Copy, Default)]
pub struct Rejected;

pub trait JoinState: Send + Sync + 'static + private::Sealed {}

impl JoinState for NotJoined {}
impl JoinState for NegotiatingRemote {}
impl JoinState for EventSubmitted {}
impl JoinState for Joined {}
impl JoinState for Rejected {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::NotJoined {}
    impl Sealed for super::NegotiatingRemote {}
    impl Sealed for super::EventSubmitted {}
    impl Sealed for super::Joined {}
    impl Sealed for super::Rejected {}
}

// ============================================================================
// Typed Join State
// ============================================================================

/// One join attempt. Transitions consume the machine, so a join can only
/// complete once and only after its event was submitted.
#[derive(Debug, Clone)]
pub struct JoinMachine<S: JoinState> {
    room_id: RoomId,
    user_id: UserId,
    event_id: Option<EventId>,
    via: Option<ServerName>,
    _marker: PhantomData<S>,
}

impl<S: JoinState> JoinMachine<S> {
    fn into_state<T: JoinState>(self) -> JoinMachine<T> {
        JoinMachine {
            room_id: self.room_id,
            user_id: self.user_id,
            event_id: self.event_id,
            via: self.via,
            _marker: PhantomData,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

impl JoinMachine<NotJoined> {
    pub fn new(room_id: RoomId, user_id: UserId) -> Self {
        Self {
            room_id,
            user_id,
            event_id: None,
            via: None,
            _marker: PhantomData,
        }
    }

    pub fn negotiate(self) -> JoinMachine<NegotiatingRemote> {
        self.into_state()
    }

    /// Local join: the event was built from our own state.
    pub fn submit(mut self, event_id: EventId) -> JoinMachine<EventSubmitted> {
        self.event_id = Some(event_id);
        self.into_state()
    }
}

impl JoinMachine<NegotiatingRemote> {
    /// A resident server accepted our join event.
    pub fn submit(mut self, event_id: EventId, via: ServerName) -> JoinMachine<EventSubmitted> {
        self.event_id = Some(event_id);
        self.via = Some(via);
        self.into_state()
    }

    /// No candidate server would take the join.
    pub fn reject(self) -> JoinMachine<Rejected> {
        self.into_state()
    }
}

impl JoinMachine<EventSubmitted> {
    pub fn accept(self) -> JoinMachine<Joined> {
        self.into_state()
    }

    pub fn reject(self) -> JoinMachine<Rejected> {
        self.into_state()
    }
}

impl JoinMachine<Joined> {
    pub fn into_response(self) -> PerformJoinResponse {
        PerformJoinResponse {
            event_id: self.event_id,
            joined_via: self.via,
            ..Default::default()
        }
    }
}

impl JoinMachine<Rejected> {
    /// The event that was refused, if one got as far as being built.
    pub fn event_id(&self) -> Option<&EventId> {
        self.event_id.as_ref()
    }
}

// ============================================================================
// Joiner
// ============================================================================

impl Performers {
    pub async fn perform_join(
        &self,
        ctx: &RequestContext,
        req: &PerformJoinRequest,
    ) -> Result<PerformJoinResponse, RoomserverError> {
        self.require_local(&req.user_id)?;
        let machine = JoinMachine::new(req.room_id.clone(), req.user_id.clone());

        if self.is_resident(&req.room_id).await? {
            return self.join_local(ctx, req, machine).await;
        }
        self.join_remote(ctx, req, machine.negotiate()).await
    }

    fn join_content(req: &PerformJoinRequest) -> serde_json::Value {
        let mut content = MemberContent::new(Membership::Join);
        content.displayname = req.displayname.clone();
        content.reason = req.reason.clone();
        content.to_value()
    }

    async fn join_local(
        &self,
        ctx: &RequestContext,
        req: &PerformJoinRequest,
        machine: JoinMachine<NotJoined>,
    ) -> Result<PerformJoinResponse, RoomserverError> {
        if let Some(record) = self.db.membership(&req.room_id, &req.user_id).await?
            && record.membership == Membership::Join
        {
            debug!(user_id = %req.user_id, "Already joined");
            return Ok(machine.submit(record.event_id).accept().into_response());
        }

        let (_, event) = self
            .build_event(
                &req.room_id,
                &req.user_id,
                event_type::MEMBER,
                Some(req.user_id.as_str()),
                Self::join_content(req),
            )
            .await?;
        let submitted = machine.submit(event.event_id().clone());
        match self
            .inputer
            .input_event(ctx, InputRoomEvent::new(InputKind::New, event))
            .await
        {
            Ok(_) => {
                info!(room_id = %req.room_id, user_id = %req.user_id, "Joined room");
                Ok(submitted.accept().into_response())
            }
            Err(err) => {
                let rejected = submitted.reject();
                warn!(event_id = ?rejected.event_id(), error = %err, "Local join refused");
                Err(err)
            }
        }
    }

    async fn join_remote(
        &self,
        ctx: &RequestContext,
        req: &PerformJoinRequest,
        machine: JoinMachine<NegotiatingRemote>,
    ) -> Result<PerformJoinResponse, RoomserverError> {
        let candidates = self.candidates(&req.room_id, &req.server_names);
        if candidates.is_empty() {
            return Err(RoomserverError::RemoteNegotiationFailed(format!(
                "no server to join {} through",
                req.room_id
            )));
        }

        let mut last_error = None;
        for server in candidates {
            match self.join_via(ctx, req, &server).await {
                Ok((version, event_id)) => {
                    let submitted = machine.submit(event_id, server.clone());
                    info!(
                        room_id = %req.room_id,
                        user_id = %req.user_id,
                        via = %server,
                        version = %version,
                        "Joined remote room"
                    );
                    return Ok(submitted.accept().into_response());
                }
                Err(err @ (RoomserverError::Cancelled | RoomserverError::Unauthorized { .. })) => {
                    machine.reject();
                    return Err(err);
                }
                Err(err) => {
                    warn!(server = %server, error = %err, "Join through server failed");
                    last_error = Some(err);
                }
            }
        }

        machine.reject();
        Err(RoomserverError::RemoteNegotiationFailed(match last_error {
            Some(err) => err.to_string(),
            None => "no server accepted the join".into(),
        }))
    }

    /// One make_join/send_join round with `server`.
    async fn join_via(
        &self,
        ctx: &RequestContext,
        req: &PerformJoinRequest,
        server: &ServerName,
    ) -> Result<(RoomVersion, EventId), RoomserverError> {
        let made = ctx
            .run(async {
                Ok(self
                    .federation
                    .make_join(server, &req.room_id, &req.user_id)
                    .await?)
            })
            .await?;
        let mut template = made.template;
        if template.sender != req.user_id
            || template.event_type != event_type::MEMBER
            || template.room_id != req.room_id
        {
            return Err(RoomserverError::RemoteNegotiationFailed(format!(
                "{server} returned a template for a different join"
            )));
        }
        template.content = Self::join_content(req);
        template.state_key = Some(req.user_id.to_string());
        let event = template.into_event(self.local.clone(), now_ms());

        let joined = ctx
            .run(async { Ok(self.federation.send_join(server, event.clone()).await?) })
            .await?;

        let state_ids: Vec<EventId> = joined
            .state_events
            .iter()
            .map(|e| e.event_id().clone())
            .collect();
        self.input_outliers(
            ctx,
            server,
            joined.auth_chain.into_iter().chain(joined.state_events),
        )
        .await?;

        let event_id = event.event_id().clone();
        self.inputer
            .input_event(
                ctx,
                InputRoomEvent::new(InputKind::New, event).with_state(state_ids),
            )
            .await?;
        Ok((made.room_version, event_id))
    }
}
