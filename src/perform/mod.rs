//! Membership performers.
//!
//! Each performer drives one user- or server-initiated room operation:
//! building events from current state, negotiating with resident servers
//! when the room is not held locally, and feeding the results through the
//! input pipeline. Performers never write room state directly.
//!
//! Outputs that are not tied to a room event (peeks) are returned in
//! [`Performed::outputs`] for the façade to append to the room's log.

mod backfill;
mod builder;
mod forget;
mod inbound_peek;
mod invite;
mod join;
mod leave;
mod peek;
mod publish;
mod unpeek;

pub use join::{EventSubmitted, JoinMachine, JoinState, Joined, NegotiatingRemote, NotJoined, Rejected};
pub use peek::{Observing, PeekMachine, PeekState, Peeking, Stopped};

use crate::config::BackfillConfig;
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::federation::FederationApi;
use crate::input::{InputKind, InputRoomEvent, Inputer};
use crate::output::OutputEvent;
use crate::query::Queryer;
use crate::security::ServerAcls;
use crate::storage::Database;
use slroom_proto::{Event, EventId, RoomId, ServerName, UserId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// How long a remote server may rely on an inbound peek before renewing it.
pub const PEEK_RENEWAL_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// A performer's response plus the outputs it produced.
#[derive(Debug)]
pub struct Performed<T> {
    pub response: T,
    pub outputs: Vec<OutputEvent>,
}

impl<T> Performed<T> {
    pub fn new(response: T) -> Self {
        Self {
            response,
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: OutputEvent) -> Self {
        self.outputs.push(output);
        self
    }
}

/// Everything the performers share. Built once federation is attached.
pub struct Performers {
    local: ServerName,
    db: Arc<dyn Database>,
    acls: Arc<ServerAcls>,
    queryer: Arc<Queryer>,
    inputer: Arc<Inputer>,
    federation: Arc<dyn FederationApi>,
    perspective_servers: Vec<ServerName>,
    backfill: BackfillConfig,
}

impl Performers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: ServerName,
        db: Arc<dyn Database>,
        acls: Arc<ServerAcls>,
        queryer: Arc<Queryer>,
        inputer: Arc<Inputer>,
        federation: Arc<dyn FederationApi>,
        perspective_servers: Vec<ServerName>,
        backfill: BackfillConfig,
    ) -> Self {
        Self {
            local,
            db,
            acls,
            queryer,
            inputer,
            federation,
            perspective_servers,
            backfill,
        }
    }

    fn require_local(&self, user_id: &UserId) -> Result<(), RoomserverError> {
        if user_id.server_name() == self.local {
            Ok(())
        } else {
            Err(RoomserverError::BadRequest(format!(
                "{user_id} is not a local user"
            )))
        }
    }

    /// Whether a local user is joined to the room in current state.
    async fn is_resident(&self, room_id: &RoomId) -> Result<bool, RoomserverError> {
        if self.db.room(room_id).await?.is_none() {
            return Ok(false);
        }
        Ok(self.queryer.joined_servers(room_id).await?.contains(&self.local))
    }

    /// Servers to negotiate with: `preferred` in order, then the room's own
    /// server, never ourselves.
    fn candidates(&self, room_id: &RoomId, preferred: &[ServerName]) -> Vec<ServerName> {
        let mut servers: Vec<ServerName> = Vec::new();
        for server in preferred.iter().cloned().chain([room_id.server_name()]) {
            if server != self.local && !servers.contains(&server) {
                servers.push(server);
            }
        }
        servers
    }

    /// Store a resident server's state and auth chain as outliers, oldest
    /// first. Individual rejections are logged and skipped.
    async fn input_outliers(
        &self,
        ctx: &RequestContext,
        origin: &ServerName,
        events: impl IntoIterator<Item = Event>,
    ) -> Result<(), RoomserverError> {
        let mut unique: BTreeMap<EventId, Event> = BTreeMap::new();
        for event in events {
            unique.entry(event.event_id().clone()).or_insert(event);
        }
        let mut ordered: Vec<Event> = unique.into_values().collect();
        ordered.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.event_id().cmp(b.event_id()))
        });

        for event in ordered {
            let id = event.event_id().clone();
            let input = InputRoomEvent::new(InputKind::Outlier, event).with_origin(origin.clone());
            match self.inputer.input_event(ctx, input).await {
                Ok(_) => {}
                Err(err @ RoomserverError::Unauthorized { .. }) => {
                    warn!(event_id = %id, error = %err, "Skipping unauthorized state event");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
