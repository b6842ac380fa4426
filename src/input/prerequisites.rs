//! Fetching what an event needs before it can be processed.
//!
//! Runs outside the room actor so slow remote servers never block a room.
//! Fetched events go through the pipeline themselves, oldest first: auth
//! events as outliers, prev events as live events. Whatever is still missing
//! afterwards is reported by the actor when it processes the event.

use super::{InputKind, InputRoomEvent, Inputer};
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::federation::FederationError;
use rand::Rng;
use slroom_proto::{Event, EventId, ServerName, event_type};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use tracing::{debug, warn};

impl Inputer {
    pub(super) async fn ensure_prerequisites(
        &self,
        ctx: &RequestContext,
        input: &InputRoomEvent,
        origin: &ServerName,
    ) -> Result<(), RoomserverError> {
        let event = &input.event;
        // Our own events are built from what we already hold; for those,
        // ask the server that created the event.
        let source = if origin == &self.shared.local {
            event.origin()
        } else {
            origin
        };
        if source == &self.shared.local {
            return Ok(());
        }

        self.fetch_missing_auth(ctx, source, event).await?;
        if input.kind == InputKind::New && !input.has_state && !event.is_type(event_type::CREATE) {
            self.fetch_missing_prevs(ctx, source, event).await?;
        }
        Ok(())
    }

    /// Ids from `ids` with no stored event.
    async fn unknown(&self, ids: &[EventId]) -> Result<Vec<EventId>, RoomserverError> {
        let stored = self.shared.db.events(ids).await?;
        Ok(ids
            .iter()
            .filter(|id| !stored.iter().any(|s| s.event_id() == *id))
            .cloned()
            .collect())
    }

    /// Ids from `ids` with no stored event, or stored without state.
    async fn stateless(&self, ids: &[EventId]) -> Result<Vec<EventId>, RoomserverError> {
        let stored = self.shared.db.events(ids).await?;
        Ok(ids
            .iter()
            .filter(|id| {
                !stored
                    .iter()
                    .any(|s| s.event_id() == *id && (s.state_after.is_some() || s.is_rejected()))
            })
            .cloned()
            .collect())
    }

    async fn fetch_missing_auth(
        &self,
        ctx: &RequestContext,
        source: &ServerName,
        event: &Event,
    ) -> Result<(), RoomserverError> {
        let missing = self.unknown(event.auth_events()).await?;
        if missing.is_empty() {
            return Ok(());
        }
        debug!(count = missing.len(), source = %source, "Fetching missing auth events");
        let federation = self.federation();

        let mut fetched: BTreeMap<EventId, Event> = BTreeMap::new();
        match self
            .retrying(ctx, "event_auth", || {
                federation.event_auth(source, event.room_id(), event.event_id())
            })
            .await?
        {
            Ok(chain) => {
                for auth in chain {
                    fetched.insert(auth.event_id().clone(), auth);
                }
            }
            Err(err) => {
                // The source may not have stored the event yet (invites are
                // countersigned before they are sent). Walk the chain instead.
                debug!(error = %err, "event_auth unavailable, fetching auth events one by one");
                let mut queue = missing;
                let mut seen = BTreeSet::new();
                while let Some(id) = queue.pop() {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    match self
                        .retrying(ctx, "get_event", || federation.get_event(source, &id))
                        .await?
                    {
                        Ok(auth) => {
                            queue.extend(self.unknown(auth.auth_events()).await?);
                            fetched.insert(id, auth);
                        }
                        Err(err) => warn!(event_id = %id, error = %err, "Could not fetch auth event"),
                    }
                }
            }
        }

        let known = self
            .shared
            .db
            .events(&fetched.keys().cloned().collect::<Vec<_>>())
            .await?;
        fetched.retain(|id, _| !known.iter().any(|s| s.event_id() == id));
        for auth in by_depth(fetched.into_values()) {
            let id = auth.event_id().clone();
            let input = InputRoomEvent::new(InputKind::Outlier, auth).with_origin(source.clone());
            if let Err(err) = self.input_boxed(ctx, input).await {
                warn!(event_id = %id, error = %err, "Fetched auth event not accepted");
            }
        }
        Ok(())
    }

    async fn fetch_missing_prevs(
        &self,
        ctx: &RequestContext,
        source: &ServerName,
        event: &Event,
    ) -> Result<(), RoomserverError> {
        if self.stateless(event.prev_events()).await?.is_empty() {
            return Ok(());
        }
        let federation = self.federation();
        let earliest = self
            .shared
            .db
            .room(event.room_id())
            .await?
            .map(|r| r.forward_extremities)
            .unwrap_or_default();
        let latest = [event.event_id().clone()];
        debug!(source = %source, "Fetching missing prev events");

        match self
            .retrying(ctx, "get_missing_events", || {
                federation.get_missing_events(
                    source,
                    event.room_id(),
                    &earliest,
                    &latest,
                    self.config.max_missing_events,
                )
            })
            .await?
        {
            Ok(events) => {
                for missing in by_depth(events) {
                    self.input_fetched(ctx, source, missing).await;
                }
            }
            Err(err) => debug!(error = %err, "get_missing_events unavailable"),
        }

        // Gaps longer than one batch are closed event by event.
        for id in self.stateless(event.prev_events()).await? {
            match self
                .retrying(ctx, "get_event", || federation.get_event(source, &id))
                .await?
            {
                Ok(prev) => self.input_fetched(ctx, source, prev).await,
                Err(err) => warn!(event_id = %id, error = %err, "Could not fetch prev event"),
            }
        }
        Ok(())
    }

    async fn input_fetched(&self, ctx: &RequestContext, source: &ServerName, event: Event) {
        let id = event.event_id().clone();
        let input = InputRoomEvent::new(InputKind::New, event).with_origin(source.clone());
        if let Err(err) = self.input_boxed(ctx, input).await {
            warn!(event_id = %id, error = %err, "Fetched prev event not accepted");
        }
    }

    /// Call `request` until it succeeds, fails permanently, or the retry
    /// budget runs out. The outer error is cancellation.
    async fn retrying<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        method: &'static str,
        mut request: F,
    ) -> Result<Result<T, FederationError>, RoomserverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FederationError>>,
    {
        let attempts = self.config.max_missing_retries.max(1);
        let mut attempt = 0;
        loop {
            let result = ctx.run(async { Ok(request().await) }).await?;
            match result {
                Ok(value) => {
                    crate::metrics::record_missing_fetch("ok");
                    return Ok(Ok(value));
                }
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let base = self.config.backoff(attempt);
                    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
                    let delay = base + std::time::Duration::from_millis(jitter);
                    warn!(method, attempt, error = %err, delay_ms = delay.as_millis() as u64, "Retrying federation request");
                    ctx.sleep(delay).await?;
                    attempt += 1;
                }
                Err(err) => {
                    crate::metrics::record_missing_fetch("failed");
                    return Ok(Err(err));
                }
            }
        }
    }
}

/// Oldest first, ties broken by id so the order is stable.
fn by_depth(events: impl IntoIterator<Item = Event>) -> Vec<Event> {
    let mut events: Vec<Event> = events.into_iter().collect();
    events.sort_by(|a, b| {
        a.depth()
            .cmp(&b.depth())
            .then_with(|| a.event_id().cmp(b.event_id()))
    });
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use slroom_proto::{EventBuilder, RoomId, UserId};

    #[test]
    fn by_depth_orders_oldest_first() {
        let room = RoomId::parse("!r:a.example").unwrap();
        let user = UserId::parse("@a:a.example").unwrap();
        let make = |depth| {
            EventBuilder::new(room.clone(), user.clone(), event_type::MESSAGE, json!({"n": depth}))
                .depth(depth)
                .build()
        };
        let sorted = by_depth(vec![make(3), make(1), make(2)]);
        let depths: Vec<u64> = sorted.iter().map(|e| e.depth()).collect();
        assert_eq!(depths, vec![1, 2, 3]);
    }
}
