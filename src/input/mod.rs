//! Event input pipeline.
//!
//! Every event that changes a room enters through the [`Inputer`]. Work is
//! split in two phases:
//!
//! 1. **Prerequisites** (concurrent): id verification, the ACL check, and
//!    fetching missing auth and prev events from the origin server.
//! 2. **Processing** (serialized per room): a [`actor::RoomInputActor`]
//!    computes state, authorizes, updates extremities and current state, and
//!    commits the event together with its output records.
//!
//! Rooms are independent, so different rooms are processed in parallel.

mod actor;
mod manager;
mod prerequisites;
mod process;

use crate::config::InputConfig;
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::federation::{FederationApi, NoFederation};
use crate::output::{OutputEvent, OutputRecord, OutputStream};
use crate::security::{ServerAcls, is_exempt};
use crate::storage::{Database, EventStatus, StoredEvent};
use crate::telemetry::spans;
use actor::RoomCommand;
use futures_util::future::BoxFuture;
use manager::RoomActorManager;
use process::InputShared;
use serde::{Deserialize, Serialize};
use slroom_proto::{Event, EventId, RoomId, ServerName, UserId};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, info, warn};

// ============================================================================
// Input types
// ============================================================================

/// How an event should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// A live event extending the room's timeline.
    New,
    /// An event known only for its place in an auth chain or state set.
    Outlier,
    /// A historical event arriving through backfill.
    Old,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Outlier => "outlier",
            Self::Old => "old",
        }
    }
}

/// One event submitted to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRoomEvent {
    pub kind: InputKind,
    pub event: Event,
    /// Server the event was received from. `None` for local submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ServerName>,
    /// Use `state_event_ids` as the state before the event instead of
    /// deriving it from prev events.
    #[serde(default)]
    pub has_state: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_event_ids: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl InputRoomEvent {
    pub fn new(kind: InputKind, event: Event) -> Self {
        Self {
            kind,
            event,
            origin: None,
            has_state: false,
            state_event_ids: Vec::new(),
            transaction_id: None,
        }
    }

    pub fn with_origin(mut self, origin: ServerName) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_state(mut self, state_event_ids: Vec<EventId>) -> Self {
        self.has_state = true;
        self.state_event_ids = state_event_ids;
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// What the pipeline did with an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOutcome {
    pub event_id: EventId,
    pub status: EventStatus,
    /// The event was already stored; nothing changed.
    pub already_known: bool,
}

impl InputOutcome {
    fn stored(event: &StoredEvent, already_known: bool) -> Self {
        Self {
            event_id: event.event_id().clone(),
            status: event.status.clone(),
            already_known,
        }
    }
}

/// Result of a batch: outcomes for the events processed before the first
/// failure, and that failure if there was one.
#[derive(Debug, Default)]
pub struct InputBatch {
    pub outcomes: Vec<InputOutcome>,
    pub error: Option<RoomserverError>,
}

struct QueuedBatch {
    room_id: RoomId,
    events: Vec<InputRoomEvent>,
}

// ============================================================================
// Inputer
// ============================================================================

pub struct Inputer {
    shared: Arc<InputShared>,
    actors: RoomActorManager,
    config: InputConfig,
    federation: OnceLock<Arc<dyn FederationApi>>,
    queue: OnceLock<mpsc::Sender<QueuedBatch>>,
}

impl Inputer {
    pub fn new(
        local: ServerName,
        db: Arc<dyn Database>,
        acls: Arc<ServerAcls>,
        output: OutputStream,
        config: InputConfig,
    ) -> Self {
        let shared = Arc::new(InputShared {
            local,
            db,
            acls,
            output,
        });
        Self {
            actors: RoomActorManager::new(
                Arc::clone(&shared),
                config.room_queue_capacity,
                config.actor_idle(),
            ),
            shared,
            config,
            federation: OnceLock::new(),
            queue: OnceLock::new(),
        }
    }

    /// Set the collaborator used to fetch missing events. Only the first call
    /// has an effect.
    pub(crate) fn set_federation(&self, federation: Arc<dyn FederationApi>) {
        if self.federation.set(federation).is_err() {
            warn!("Federation already attached to the inputer");
        }
    }

    fn federation(&self) -> Arc<dyn FederationApi> {
        self.federation
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(NoFederation))
    }

    /// Check storage and start the consumer for asynchronous input.
    ///
    /// An error here means the component cannot work at all.
    pub async fn start(self: &Arc<Self>) -> Result<(), RoomserverError> {
        self.shared.db.ping().await?;

        let (tx, mut rx) = mpsc::channel::<QueuedBatch>(self.config.async_queue_capacity.max(1));
        self.queue
            .set(tx)
            .map_err(|_| RoomserverError::Internal("input consumer already started".into()))?;

        let inputer: Weak<Inputer> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let Some(inputer) = inputer.upgrade() else {
                    break;
                };
                let ctx = RequestContext::new();
                let result = inputer
                    .process_input_events(&ctx, &batch.room_id, batch.events)
                    .await;
                if let Some(err) = result.error {
                    warn!(room_id = %batch.room_id, error = %err, "Queued input failed");
                }
            }
            debug!("Input consumer stopped");
        });

        info!(server = %self.shared.local, "Input pipeline started");
        Ok(())
    }

    /// Queue a batch for background processing and return immediately.
    pub async fn queue_input_events(
        &self,
        room_id: &RoomId,
        events: Vec<InputRoomEvent>,
    ) -> Result<(), RoomserverError> {
        let queue = self
            .queue
            .get()
            .ok_or_else(|| RoomserverError::Internal("input consumer not started".into()))?;
        queue
            .send(QueuedBatch {
                room_id: room_id.clone(),
                events,
            })
            .await
            .map_err(|_| RoomserverError::Internal("input consumer stopped".into()))
    }

    /// Process events in order, stopping at the first failure.
    pub async fn process_input_events(
        &self,
        ctx: &RequestContext,
        room_id: &RoomId,
        events: Vec<InputRoomEvent>,
    ) -> InputBatch {
        let mut batch = InputBatch::default();
        for input in events {
            if input.event.room_id() != room_id {
                batch.error = Some(RoomserverError::BadRequest(format!(
                    "event {} is not in room {room_id}",
                    input.event.event_id()
                )));
                break;
            }
            match self.input_event(ctx, input).await {
                Ok(outcome) => batch.outcomes.push(outcome),
                Err(err) => {
                    batch.error = Some(err);
                    break;
                }
            }
        }
        batch
    }

    /// Process a single event.
    pub async fn input_event(
        &self,
        ctx: &RequestContext,
        input: InputRoomEvent,
    ) -> Result<InputOutcome, RoomserverError> {
        let origin = input
            .origin
            .clone()
            .unwrap_or_else(|| self.shared.local.clone());
        let span = spans::input_event(input.event.event_id(), input.kind.as_str(), &origin);
        let kind = input.kind;
        let result = self.input_event_inner(ctx, input, &origin).instrument(span).await;
        match &result {
            Ok(outcome) if outcome.already_known => crate::metrics::record_input(kind.as_str(), "known"),
            Ok(_) => crate::metrics::record_input(kind.as_str(), "accepted"),
            Err(RoomserverError::Unauthorized { .. }) => {
                crate::metrics::record_input(kind.as_str(), "rejected")
            }
            Err(err) => crate::metrics::record_input(kind.as_str(), err.error_code()),
        }
        result
    }

    /// Boxed entry point for inputting fetched events from inside prerequisite
    /// handling, which would otherwise make the future type recursive.
    fn input_boxed<'a>(
        &'a self,
        ctx: &'a RequestContext,
        input: InputRoomEvent,
    ) -> BoxFuture<'a, Result<InputOutcome, RoomserverError>> {
        Box::pin(self.input_event(ctx, input))
    }

    async fn input_event_inner(
        &self,
        ctx: &RequestContext,
        input: InputRoomEvent,
        origin: &ServerName,
    ) -> Result<InputOutcome, RoomserverError> {
        ctx.check()?;
        let event = &input.event;
        if !event.verify_id() {
            return Err(RoomserverError::BadRequest(format!(
                "event id {} does not match the event content",
                event.event_id()
            )));
        }

        if origin != &self.shared.local
            && !is_exempt(event, origin)
            && self
                .shared
                .acls
                .is_server_banned_from_room(origin, event.room_id())
                .await
        {
            crate::metrics::record_acl_denied();
            return Err(RoomserverError::ForbiddenOrigin {
                server: origin.to_string(),
                room_id: event.room_id().clone(),
            });
        }

        self.ensure_prerequisites(ctx, &input, origin).await?;

        let room_id = input.event.room_id().clone();
        let (reply, rx) = oneshot::channel();
        self.actors
            .send(
                &room_id,
                RoomCommand::Input {
                    input: Box::new(input),
                    reply,
                },
            )
            .await?;
        rx.await
            .map_err(|_| RoomserverError::Internal("room actor dropped the request".into()))?
    }

    /// Append output events that are not tied to a room event, ordered after
    /// everything already submitted for the room.
    pub async fn write_output_events(
        &self,
        room_id: &RoomId,
        events: Vec<OutputEvent>,
    ) -> Result<Vec<OutputRecord>, RoomserverError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let (reply, rx) = oneshot::channel();
        self.actors
            .send(room_id, RoomCommand::WriteOutput { events, reply })
            .await?;
        rx.await
            .map_err(|_| RoomserverError::Internal("room actor dropped the request".into()))?
    }

    /// Drop `user_id`'s membership record for `room_id`, in turn with the
    /// room's input. Fails while the user is joined.
    pub async fn forget(&self, room_id: &RoomId, user_id: &UserId) -> Result<bool, RoomserverError> {
        let (reply, rx) = oneshot::channel();
        self.actors
            .send(
                room_id,
                RoomCommand::Forget {
                    user_id: user_id.clone(),
                    reply,
                },
            )
            .await?;
        rx.await
            .map_err(|_| RoomserverError::Internal("room actor dropped the request".into()))?
    }

    /// Number of rooms with a running input actor.
    pub fn active_rooms(&self) -> usize {
        self.actors.len()
    }
}
