//! Serving another server's peek.

use super::{PEEK_RENEWAL_INTERVAL_MS, Performed, Performers, now_ms};
use crate::api::{PerformInboundPeekRequest, PerformInboundPeekResponse};
use crate::error::RoomserverError;
use crate::output::OutputEvent;
use crate::storage::InboundPeekRecord;
use slroom_proto::Event;
use tracing::info;

impl Performers {
    /// Hand `req.server_name` the state at our latest event and remember
    /// that it is peeking. An unknown room is not an error: the response
    /// says the room does not exist.
    pub async fn perform_inbound_peek(
        &self,
        req: &PerformInboundPeekRequest,
    ) -> Result<Performed<PerformInboundPeekResponse>, RoomserverError> {
        let Some(room) = self.db.room(&req.room_id).await? else {
            return Ok(Performed::new(PerformInboundPeekResponse::default()));
        };
        if self
            .acls
            .is_server_banned_from_room(&req.server_name, &req.room_id)
            .await
        {
            crate::metrics::record_acl_denied();
            return Err(RoomserverError::ForbiddenOrigin {
                server: req.server_name.to_string(),
                room_id: req.room_id.clone(),
            });
        }
        if !self.queryer.is_world_readable(&req.room_id).await? {
            return Err(RoomserverError::Unauthorized {
                event_id: None,
                reason: format!("history of {} is not world readable", req.room_id),
            });
        }

        let latest = self.queryer.latest_event(&room).await?;
        let before = self.queryer.state_before(&latest).await?;
        let state_events = self.queryer.state_events(&before, &[]).await?;
        let mut seeds: Vec<&Event> = state_events.iter().collect();
        seeds.push(&latest.event);
        let auth_chain = self.queryer.auth_chain(&seeds).await?;

        self.db
            .add_inbound_peek(InboundPeekRecord {
                room_id: req.room_id.clone(),
                server_name: req.server_name.clone(),
                peek_id: req.peek_id.clone(),
                renewal_interval_ms: PEEK_RENEWAL_INTERVAL_MS,
                created_at: now_ms(),
            })
            .await?;
        info!(room_id = %req.room_id, server = %req.server_name, peek_id = %req.peek_id, "Serving inbound peek");

        let output = OutputEvent::NewInboundPeek {
            room_id: req.room_id.clone(),
            server_name: req.server_name.clone(),
            peek_id: req.peek_id.clone(),
            latest_event_id: latest.event_id().clone(),
            renewal_interval_ms: PEEK_RENEWAL_INTERVAL_MS,
        };
        Ok(Performed::new(PerformInboundPeekResponse {
            room_exists: true,
            room_version: Some(room.version),
            state_events,
            auth_chain,
            latest_event: Some(latest.event),
            renewal_interval_ms: PEEK_RENEWAL_INTERVAL_MS,
            ..Default::default()
        })
        .with_output(output))
    }
}
