//! Peeking into rooms without joining.
//!
//! ```text
//! ┌─────────┐  state held  ┌───────────┐  unpeek  ┌─────────┐
//! │ Peeking ├─────────────►│ Observing ├─────────►│ Stopped │
//! └─────────┘              └───────────┘          └─────────┘
//! ```
//!
//! A room we hold state for is peeked locally when its history is world
//! readable. Otherwise a resident server is asked for its state, which is
//! stored before the peek is recorded.

use super::{Performed, Performers};
use crate::api::{PerformPeekRequest, PerformPeekResponse};
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::input::{InputKind, InputRoomEvent};
use crate::output::OutputEvent;
use crate::storage::PeekRecord;
use slroom_proto::{EventId, RoomId, ServerName, UserId};
use std::marker::PhantomData;
use tracing::{info, warn};

// ============================================================================
// State Marker Types (Zero-Sized)
// ============================================================================

/// Setting up: state is not yet held locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct Peeking;

/// The device is following the room.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observing;

#[derive(Debug, Clone, Copy, Default)]
pub struct Stopped;

pub trait PeekState: Send + Sync + 'static + private::Sealed {}

impl PeekState for Peeking {}
impl PeekState for Observing {}
impl PeekState for Stopped {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Peeking {}
    impl Sealed for super::Observing {}
    impl Sealed for super::Stopped {}
}

/// One device's peek of one room.
#[derive(Debug, Clone)]
pub struct PeekMachine<S: PeekState> {
    room_id: RoomId,
    user_id: UserId,
    device_id: String,
    _marker: PhantomData<S>,
}

impl<S: PeekState> PeekMachine<S> {
    fn into_state<T: PeekState>(self) -> PeekMachine<T> {
        PeekMachine {
            room_id: self.room_id,
            user_id: self.user_id,
            device_id: self.device_id,
            _marker: PhantomData,
        }
    }
}

impl PeekMachine<Peeking> {
    pub fn new(room_id: RoomId, user_id: UserId, device_id: impl Into<String>) -> Self {
        Self {
            room_id,
            user_id,
            device_id: device_id.into(),
            _marker: PhantomData,
        }
    }

    pub fn observe(self) -> PeekMachine<Observing> {
        self.into_state()
    }
}

impl PeekMachine<Observing> {
    /// An existing peek, as recorded in storage.
    pub fn resume(record: &PeekRecord) -> Self {
        PeekMachine::new(
            record.room_id.clone(),
            record.user_id.clone(),
            record.device_id.clone(),
        )
        .observe()
    }

    pub fn record(&self) -> PeekRecord {
        PeekRecord {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            created_at: super::now_ms(),
        }
    }

    pub fn started(&self) -> OutputEvent {
        OutputEvent::NewPeek {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
        }
    }

    pub fn stop(self) -> PeekMachine<Stopped> {
        self.into_state()
    }
}

impl PeekMachine<Stopped> {
    pub fn retired(&self) -> OutputEvent {
        OutputEvent::RetirePeek {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

// ============================================================================
// Peeker
// ============================================================================

impl Performers {
    pub async fn perform_peek(
        &self,
        ctx: &RequestContext,
        req: &PerformPeekRequest,
    ) -> Result<Performed<PerformPeekResponse>, RoomserverError> {
        self.require_local(&req.user_id)?;
        if req.device_id.is_empty() {
            return Err(RoomserverError::BadRequest("peek needs a device id".into()));
        }
        let machine = PeekMachine::new(req.room_id.clone(), req.user_id.clone(), req.device_id.as_str());

        let peeked_via = if self.db.room(&req.room_id).await?.is_some() {
            if !self.queryer.is_world_readable(&req.room_id).await? {
                return Err(RoomserverError::Unauthorized {
                    event_id: None,
                    reason: format!("history of {} is not world readable", req.room_id),
                });
            }
            None
        } else {
            Some(self.peek_remote(ctx, req).await?)
        };

        let observing = machine.observe();
        self.db.add_peek(observing.record()).await?;
        info!(room_id = %req.room_id, user_id = %req.user_id, device_id = %req.device_id, "Peeking room");
        Ok(Performed::new(PerformPeekResponse {
            room_id: Some(req.room_id.clone()),
            peeked_via,
            ..Default::default()
        })
        .with_output(observing.started()))
    }

    async fn peek_remote(
        &self,
        ctx: &RequestContext,
        req: &PerformPeekRequest,
    ) -> Result<ServerName, RoomserverError> {
        let candidates = self.candidates(&req.room_id, &req.server_names);
        let peek_id = uuid::Uuid::new_v4().to_string();

        let mut last_error = None;
        for server in candidates {
            match self.peek_via(ctx, req, &server, &peek_id).await {
                Ok(()) => return Ok(server),
                Err(err @ RoomserverError::Cancelled) => return Err(err),
                Err(err) => {
                    warn!(server = %server, error = %err, "Peek through server failed");
                    last_error = Some(err);
                }
            }
        }
        Err(RoomserverError::RemoteNegotiationFailed(match last_error {
            Some(err) => err.to_string(),
            None => format!("no server to peek {} through", req.room_id),
        }))
    }

    async fn peek_via(
        &self,
        ctx: &RequestContext,
        req: &PerformPeekRequest,
        server: &ServerName,
        peek_id: &str,
    ) -> Result<(), RoomserverError> {
        let peeked = ctx
            .run(async { Ok(self.federation.peek(server, &req.room_id, peek_id).await?) })
            .await?;
        if peeked.latest_event.room_id() != &req.room_id {
            return Err(RoomserverError::RemoteNegotiationFailed(format!(
                "{server} returned state for a different room"
            )));
        }

        let state_ids: Vec<EventId> = peeked
            .state_events
            .iter()
            .map(|e| e.event_id().clone())
            .collect();
        self.input_outliers(
            ctx,
            server,
            peeked.auth_chain.into_iter().chain(peeked.state_events),
        )
        .await?;
        self.inputer
            .input_event(
                ctx,
                InputRoomEvent::new(InputKind::New, peeked.latest_event)
                    .with_origin(server.clone())
                    .with_state(state_ids),
            )
            .await?;
        Ok(())
    }
}
