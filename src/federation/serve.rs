//! Inbound federation handlers.
//!
//! What this server answers when another server calls it. Transports call
//! these with the authenticated origin of the request.

use super::{FederationError, MakeJoinResponse, MakeLeaveResponse, PeekResponse, SendJoinResponse};
use crate::api::{
    PerformInboundPeekRequest, QueryBackfillRequest, QueryMissingEventsRequest,
};
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::input::{InputKind, InputRoomEvent};
use crate::roomserver::Roomserver;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha2::{Digest, Sha256};
use slroom_proto::{
    Event, EventId, MemberContent, Membership, RoomId, RoomVersion, ServerName, UserId, event_type,
};
use tracing::{debug, info};

/// Key id used when countersigning invites.
const INVITE_KEY_ID: &str = "ed25519:auto";

impl Roomserver {
    pub(crate) async fn serve_get_event(
        &self,
        origin: &ServerName,
        event_id: &EventId,
    ) -> Result<Event, FederationError> {
        let stored = self
            .db
            .event(event_id)
            .await
            .map_err(|e| self.refused(e.into()))?
            .filter(|s| !s.is_rejected())
            .ok_or_else(|| self.not_found(format!("event {event_id}")))?;
        self.check_origin(origin, stored.event.room_id()).await?;
        Ok(stored.event)
    }

    pub(crate) async fn serve_get_missing_events(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        earliest: &[EventId],
        latest: &[EventId],
        limit: usize,
    ) -> Result<Vec<Event>, FederationError> {
        self.check_origin(origin, room_id).await?;
        let req = QueryMissingEventsRequest {
            room_id: room_id.clone(),
            earliest: earliest.to_vec(),
            latest: latest.to_vec(),
            limit,
        };
        self.queryer
            .query_missing_events(&req)
            .await
            .map(|r| r.events)
            .map_err(|e| self.refused(e))
    }

    pub(crate) async fn serve_event_auth(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Vec<Event>, FederationError> {
        self.check_origin(origin, room_id).await?;
        let stored = self
            .queryer
            .stored(event_id)
            .await
            .map_err(|_| self.not_found(format!("event {event_id}")))?;
        if stored.event.room_id() != room_id {
            return Err(self.not_found(format!("event {event_id} in {room_id}")));
        }
        self.queryer
            .auth_chain(&[&stored.event])
            .await
            .map_err(|e| self.refused(e))
    }

    pub(crate) async fn serve_make_join(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<MakeJoinResponse, FederationError> {
        self.check_user_origin(origin, user_id)?;
        self.check_origin(origin, room_id).await?;
        self.require_resident(room_id).await?;

        let content = MemberContent::new(Membership::Join).to_value();
        let (room_version, template) = self
            .template_for(room_id, user_id, content)
            .await
            .map_err(|e| self.refused(e))?;
        Ok(MakeJoinResponse {
            room_version,
            template,
        })
    }

    pub(crate) async fn serve_send_join(
        &self,
        origin: &ServerName,
        event: Event,
    ) -> Result<SendJoinResponse, FederationError> {
        self.check_member_event(origin, &event, Membership::Join)?;
        let room_id = event.room_id().clone();
        self.check_origin(origin, &room_id).await?;
        self.require_resident(&room_id).await?;

        let event_id = event.event_id().clone();
        let ctx = RequestContext::new();
        self.inputer
            .input_event(
                &ctx,
                InputRoomEvent::new(InputKind::New, event).with_origin(origin.clone()),
            )
            .await
            .map_err(|e| self.refused(e))?;

        let response = async {
            let stored = self.queryer.stored(&event_id).await?;
            let before = self.queryer.state_before(&stored).await?;
            let state_events = self.queryer.state_events(&before, &[]).await?;
            let mut seeds: Vec<&Event> = state_events.iter().collect();
            seeds.push(&stored.event);
            let auth_chain = self.queryer.auth_chain(&seeds).await?;
            Ok::<_, RoomserverError>(SendJoinResponse {
                state_events,
                auth_chain,
            })
        }
        .await
        .map_err(|e| self.refused(e))?;
        info!(room_id = %room_id, origin = %origin, event_id = %event_id, "Accepted remote join");
        Ok(response)
    }

    pub(crate) async fn serve_make_leave(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<MakeLeaveResponse, FederationError> {
        self.check_user_origin(origin, user_id)?;
        self.require_resident(room_id).await?;

        let content = MemberContent::new(Membership::Leave).to_value();
        let (room_version, template) = self
            .template_for(room_id, user_id, content)
            .await
            .map_err(|e| self.refused(e))?;
        Ok(MakeLeaveResponse {
            room_version,
            template,
        })
    }

    /// Leaves are accepted even from servers the room's ACL denies.
    pub(crate) async fn serve_send_leave(
        &self,
        origin: &ServerName,
        event: Event,
    ) -> Result<(), FederationError> {
        self.check_member_event(origin, &event, Membership::Leave)?;
        self.require_resident(event.room_id()).await?;

        let event_id = event.event_id().clone();
        let ctx = RequestContext::new();
        self.inputer
            .input_event(
                &ctx,
                InputRoomEvent::new(InputKind::New, event).with_origin(origin.clone()),
            )
            .await
            .map_err(|e| self.refused(e))?;
        debug!(origin = %origin, event_id = %event_id, "Accepted remote leave");
        Ok(())
    }

    /// Store an invite for one of our users and countersign it.
    pub(crate) async fn serve_invite(
        &self,
        origin: &ServerName,
        room_version: RoomVersion,
        event: Event,
    ) -> Result<Event, FederationError> {
        if !event.is_type(event_type::MEMBER)
            || !matches!(event.membership(), Ok(Some(Membership::Invite)))
        {
            return Err(self.reject("not an invite event"));
        }
        let Some(invitee) = event.membership_target() else {
            return Err(self.reject("invite without a target"));
        };
        if invitee.server_name() != self.local {
            return Err(self.reject(format!("{invitee} is not a local user")));
        }
        if event.sender().server_name() != *origin || !event.verify_id() {
            return Err(self.reject("invite does not come from its sender's server"));
        }
        self.check_origin(origin, event.room_id()).await?;

        let resident = self
            .is_resident(event.room_id())
            .await
            .map_err(|e| self.refused(e))?;
        let kind = if resident {
            InputKind::New
        } else {
            InputKind::Outlier
        };
        let signed = event.with_signature(&self.local, INVITE_KEY_ID, &self.countersign(&event));
        let ctx = RequestContext::new();
        self.inputer
            .input_event(
                &ctx,
                InputRoomEvent::new(kind, signed.clone()).with_origin(origin.clone()),
            )
            .await
            .map_err(|e| self.refused(e))?;
        info!(
            room_id = %event.room_id(),
            invitee = %invitee,
            room_version = room_version.as_str(),
            "Received invite"
        );
        Ok(signed)
    }

    pub(crate) async fn serve_peek(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        peek_id: &str,
    ) -> Result<PeekResponse, FederationError> {
        let req = PerformInboundPeekRequest {
            room_id: room_id.clone(),
            server_name: origin.clone(),
            peek_id: peek_id.to_string(),
        };
        let response = self
            .perform("inbound_peek", room_id, |p| async move {
                p.perform_inbound_peek(&req).await
            })
            .await
            .map_err(|e| self.refused(e))?;

        match (response.room_exists, response.room_version, response.latest_event) {
            (true, Some(room_version), Some(latest_event)) => Ok(PeekResponse {
                room_version,
                state_events: response.state_events,
                auth_chain: response.auth_chain,
                latest_event,
                renewal_interval_ms: response.renewal_interval_ms,
            }),
            _ => Err(self.not_found(format!("room {room_id}"))),
        }
    }

    /// History for a server that is in the room, or anyone when the room is
    /// world readable. Newest first.
    pub(crate) async fn serve_backfill(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        from: &[EventId],
        limit: usize,
    ) -> Result<Vec<Event>, FederationError> {
        self.check_origin(origin, room_id).await?;
        let visible = async {
            Ok::<_, RoomserverError>(
                self.queryer.joined_servers(room_id).await?.contains(origin)
                    || self.queryer.is_world_readable(room_id).await?,
            )
        }
        .await
        .map_err(|e| self.refused(e))?;
        if !visible {
            return Err(self.reject(format!("{origin} is not in {room_id}")));
        }

        let req = QueryBackfillRequest {
            room_id: room_id.clone(),
            from: from.to_vec(),
            limit,
        };
        self.queryer
            .query_backfill(&req)
            .await
            .map(|r| r.events)
            .map_err(|e| self.refused(e))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn template_for(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        content: serde_json::Value,
    ) -> Result<(RoomVersion, super::EventTemplate), RoomserverError> {
        self.performers()?
            .template(room_id, user_id, event_type::MEMBER, Some(user_id.as_str()), content)
            .await
    }

    async fn check_origin(&self, origin: &ServerName, room_id: &RoomId) -> Result<(), FederationError> {
        if self.acls.is_server_banned_from_room(origin, room_id).await {
            crate::metrics::record_acl_denied();
            return Err(self.refused(RoomserverError::ForbiddenOrigin {
                server: origin.to_string(),
                room_id: room_id.clone(),
            }));
        }
        Ok(())
    }

    fn check_user_origin(&self, origin: &ServerName, user_id: &UserId) -> Result<(), FederationError> {
        if user_id.server_name() != *origin {
            return Err(self.reject(format!("{origin} cannot act for {user_id}")));
        }
        Ok(())
    }

    /// A membership event about its own sender, from the sender's server.
    fn check_member_event(
        &self,
        origin: &ServerName,
        event: &Event,
        expected: Membership,
    ) -> Result<(), FederationError> {
        if !event.is_type(event_type::MEMBER)
            || event.state_key() != Some(event.sender().as_str())
            || !matches!(event.membership(), Ok(Some(m)) if m == expected)
        {
            return Err(self.reject(format!("expected a {} event", expected.as_str())));
        }
        self.check_user_origin(origin, event.sender())
    }

    async fn is_resident(&self, room_id: &RoomId) -> Result<bool, RoomserverError> {
        if self.db.room(room_id).await?.is_none() {
            return Ok(false);
        }
        Ok(self.queryer.joined_servers(room_id).await?.contains(&self.local))
    }

    async fn require_resident(&self, room_id: &RoomId) -> Result<(), FederationError> {
        let resident = self
            .is_resident(room_id)
            .await
            .map_err(|e| self.refused(e))?;
        if resident {
            Ok(())
        } else {
            Err(self.not_found(format!("room {room_id}")))
        }
    }

    fn countersign(&self, event: &Event) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.local.as_str().as_bytes());
        hasher.update(event.event_id().as_str().as_bytes());
        STANDARD_NO_PAD.encode(hasher.finalize())
    }

    fn refused(&self, err: RoomserverError) -> FederationError {
        match err {
            RoomserverError::UnknownRoom(room_id) => self.not_found(format!("room {room_id}")),
            err => self.reject(err.to_string()),
        }
    }

    fn reject(&self, reason: impl Into<String>) -> FederationError {
        FederationError::Refused {
            server: self.local.clone(),
            reason: reason.into(),
        }
    }

    fn not_found(&self, what: impl Into<String>) -> FederationError {
        FederationError::NotFound {
            server: self.local.clone(),
            what: what.into(),
        }
    }
}
