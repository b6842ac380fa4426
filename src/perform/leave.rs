//! Leaving rooms and rejecting invites.

use super::{Performers, now_ms};
use crate::api::{PerformLeaveRequest, PerformLeaveResponse};
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::input::{InputKind, InputRoomEvent};
use crate::storage::MembershipRecord;
use slroom_proto::{
    Event, EventId, MemberContent, Membership, ServerName, StateKeyTuple, event_type,
};
use tracing::{info, warn};

impl Performers {
    pub async fn perform_leave(
        &self,
        ctx: &RequestContext,
        req: &PerformLeaveRequest,
    ) -> Result<PerformLeaveResponse, RoomserverError> {
        self.require_local(&req.user_id)?;

        if !self.is_resident(&req.room_id).await? {
            return match self.db.membership(&req.room_id, &req.user_id).await? {
                Some(record) if record.membership == Membership::Invite => {
                    self.reject_remote_invite(ctx, req, &record).await
                }
                _ => Err(RoomserverError::NotInRoom(req.room_id.clone())),
            };
        }

        let current = self.queryer.current_state(&req.room_id).await?;
        let tuple = StateKeyTuple::new(event_type::MEMBER, req.user_id.as_str());
        let membership = match current.get(&tuple) {
            Some(id) => self
                .db
                .event(id)
                .await?
                .and_then(|s| s.event.membership().ok().flatten()),
            None => None,
        };
        if !matches!(
            membership,
            Some(Membership::Join | Membership::Invite | Membership::Knock)
        ) {
            return Err(RoomserverError::NotInRoom(req.room_id.clone()));
        }

        let (_, event) = self
            .build_event(
                &req.room_id,
                &req.user_id,
                event_type::MEMBER,
                Some(req.user_id.as_str()),
                self.leave_content(req),
            )
            .await?;
        let event_id = event.event_id().clone();
        self.inputer
            .input_event(ctx, InputRoomEvent::new(InputKind::New, event))
            .await?;
        info!(room_id = %req.room_id, user_id = %req.user_id, "Left room");
        Ok(PerformLeaveResponse {
            event_id: Some(event_id),
            ..Default::default()
        })
    }

    fn leave_content(&self, req: &PerformLeaveRequest) -> serde_json::Value {
        let mut content = MemberContent::new(Membership::Leave);
        content.reason = req.reason.clone();
        content.to_value()
    }

    /// Reject an invite to a room we hold no state for, through the inviting
    /// server or the room's own server.
    async fn reject_remote_invite(
        &self,
        ctx: &RequestContext,
        req: &PerformLeaveRequest,
        invite: &MembershipRecord,
    ) -> Result<PerformLeaveResponse, RoomserverError> {
        let inviter = self
            .db
            .event(&invite.event_id)
            .await?
            .map(|s| s.event.sender().server_name());
        let preferred: Vec<ServerName> = inviter.into_iter().collect();
        let candidates = self.candidates(&req.room_id, &preferred);

        let mut last_error = None;
        for server in candidates {
            match self.leave_via(ctx, req, &server).await {
                Ok(event_id) => {
                    info!(room_id = %req.room_id, user_id = %req.user_id, via = %server, "Rejected invite");
                    return Ok(PerformLeaveResponse {
                        event_id: Some(event_id),
                        ..Default::default()
                    });
                }
                Err(err @ RoomserverError::Cancelled) => return Err(err),
                Err(err) => {
                    warn!(server = %server, error = %err, "Invite rejection through server failed");
                    last_error = Some(err);
                }
            }
        }
        Err(RoomserverError::RemoteNegotiationFailed(match last_error {
            Some(err) => err.to_string(),
            None => "no server to reject the invite through".into(),
        }))
    }

    /// One make_leave/send_leave round with `server`. The accepted leave is
    /// stored as an outlier, which retires the invite.
    async fn leave_via(
        &self,
        ctx: &RequestContext,
        req: &PerformLeaveRequest,
        server: &ServerName,
    ) -> Result<EventId, RoomserverError> {
        let made = ctx
            .run(async {
                Ok(self
                    .federation
                    .make_leave(server, &req.room_id, &req.user_id)
                    .await?)
            })
            .await?;
        let mut template = made.template;
        if template.sender != req.user_id || template.room_id != req.room_id {
            return Err(RoomserverError::RemoteNegotiationFailed(format!(
                "{server} returned a template for a different leave"
            )));
        }
        template.event_type = event_type::MEMBER.to_string();
        template.state_key = Some(req.user_id.to_string());
        template.content = self.leave_content(req);
        let event: Event = template.into_event(self.local.clone(), now_ms());

        ctx.run(async { Ok(self.federation.send_leave(server, event.clone()).await?) })
            .await?;

        let event_id = event.event_id().clone();
        // The resident server now holds the leave, so missing auth events
        // are fetched from it.
        self.inputer
            .input_event(
                ctx,
                InputRoomEvent::new(InputKind::Outlier, event).with_origin(server.clone()),
            )
            .await?;
        Ok(event_id)
    }
}
