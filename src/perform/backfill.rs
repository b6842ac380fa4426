//! Backfilling history.

use super::Performers;
use crate::api::{PerformBackfillRequest, PerformBackfillResponse, QueryBackfillRequest};
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::input::{InputKind, InputRoomEvent};
use slroom_proto::{Event, RoomId, ServerName};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl Performers {
    /// Walk back from `req.from` locally. When the walk comes up short and the
    /// request is our own, ask other servers in the room for the rest, store
    /// what they return as historical events, and walk again.
    pub async fn perform_backfill(
        &self,
        ctx: &RequestContext,
        req: &PerformBackfillRequest,
    ) -> Result<PerformBackfillResponse, RoomserverError> {
        let query = QueryBackfillRequest {
            room_id: req.room_id.clone(),
            from: req.from.clone(),
            limit: req.limit,
        };
        let local = self.queryer.query_backfill(&query).await?;
        let wanted = req.limit.min(self.backfill.max_limit);
        if local.events.len() >= wanted || req.server_name != self.local {
            return Ok(PerformBackfillResponse {
                events: local.events,
                ..Default::default()
            });
        }

        let servers = self.backfill_servers(&req.room_id).await?;
        if servers.is_empty() {
            debug!(room_id = %req.room_id, "No other servers to backfill from");
            return Ok(PerformBackfillResponse {
                events: local.events,
                ..Default::default()
            });
        }

        let (source, fetched) = self.fetch_backfill(ctx, req, wanted, &servers).await?;
        let mut fetched: Vec<Event> = fetched
            .into_iter()
            .filter(|e| e.room_id() == &req.room_id && e.verify_id())
            .collect();
        fetched.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.event_id().cmp(b.event_id()))
        });

        let mut stored = 0usize;
        for event in fetched {
            let id = event.event_id().clone();
            let input = InputRoomEvent::new(InputKind::Old, event).with_origin(source.clone());
            match self.inputer.input_event(ctx, input).await {
                Ok(_) => stored += 1,
                Err(err @ RoomserverError::Cancelled) => return Err(err),
                Err(err) => warn!(event_id = %id, error = %err, "Backfilled event not accepted"),
            }
        }
        info!(room_id = %req.room_id, via = %source, stored, "Backfilled events");

        let events = self.queryer.query_backfill(&query).await?.events;
        Ok(PerformBackfillResponse {
            events,
            ..Default::default()
        })
    }

    /// Perspective servers that are in the room first, then every other
    /// joined server in sorted order. Never ourselves.
    async fn backfill_servers(&self, room_id: &RoomId) -> Result<Vec<ServerName>, RoomserverError> {
        let joined: BTreeSet<ServerName> = self.queryer.joined_servers(room_id).await?;
        let mut servers: Vec<ServerName> = self
            .perspective_servers
            .iter()
            .filter(|s| joined.contains(*s) && **s != self.local)
            .cloned()
            .collect();
        for server in joined {
            if server != self.local && !servers.contains(&server) {
                servers.push(server);
            }
        }
        Ok(servers)
    }

    /// The first successful backfill response and the server that gave it,
    /// each server bounded by the configured timeout.
    async fn fetch_backfill(
        &self,
        ctx: &RequestContext,
        req: &PerformBackfillRequest,
        limit: usize,
        servers: &[ServerName],
    ) -> Result<(ServerName, Vec<Event>), RoomserverError> {
        let mut last_error = None;
        for server in servers {
            let attempt = ctx.child(Some(self.backfill.server_timeout()));
            let result = attempt
                .run(async {
                    Ok(self
                        .federation
                        .backfill(server, &req.room_id, &req.from, limit)
                        .await?)
                })
                .await;
            match result {
                Ok(events) => {
                    debug!(server = %server, count = events.len(), "Backfill response");
                    return Ok((server.clone(), events));
                }
                Err(RoomserverError::Cancelled) if ctx.is_cancelled() => {
                    return Err(RoomserverError::Cancelled);
                }
                Err(err) => {
                    warn!(server = %server, error = %err, "Backfill from server failed");
                    last_error = Some(err);
                }
            }
        }
        Err(RoomserverError::RemoteNegotiationFailed(match last_error {
            Some(err) => format!("backfill failed on every server: {err}"),
            None => "no server to backfill from".into(),
        }))
    }
}
