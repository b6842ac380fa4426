//! Inviting users.

use super::Performers;
use crate::api::{PerformInviteRequest, PerformInviteResponse};
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::input::{InputKind, InputRoomEvent};
use slroom_proto::{MemberContent, Membership, StateKeyTuple, event_type};
use tracing::info;

impl Performers {
    /// Invite `req.invitee`. Remote invitees get the event over federation
    /// first and it is only stored once their server has countersigned it.
    pub async fn perform_invite(
        &self,
        ctx: &RequestContext,
        req: &PerformInviteRequest,
    ) -> Result<PerformInviteResponse, RoomserverError> {
        self.require_local(&req.sender)?;
        if !self.is_resident(&req.room_id).await? {
            self.queryer.room(&req.room_id).await?;
            return Err(RoomserverError::NotInRoom(req.room_id.clone()));
        }

        let current = self.queryer.current_state(&req.room_id).await?;
        let tuple = StateKeyTuple::new(event_type::MEMBER, req.invitee.as_str());
        if let Some(id) = current.get(&tuple)
            && let Some(member) = self.db.event(id).await?
            && matches!(member.event.membership(), Ok(Some(Membership::Join)))
        {
            return Err(RoomserverError::Unauthorized {
                event_id: None,
                reason: format!("{} is already joined", req.invitee),
            });
        }

        let invitee_server = req.invitee.server_name();
        if self
            .acls
            .is_server_banned_from_room(&invitee_server, &req.room_id)
            .await
        {
            crate::metrics::record_acl_denied();
            return Err(RoomserverError::ForbiddenOrigin {
                server: invitee_server.to_string(),
                room_id: req.room_id.clone(),
            });
        }

        let mut content = MemberContent::new(Membership::Invite);
        content.reason = req.reason.clone();
        let (version, mut event) = self
            .build_event(
                &req.room_id,
                &req.sender,
                event_type::MEMBER,
                Some(req.invitee.as_str()),
                content.to_value(),
            )
            .await?;

        if invitee_server != self.local {
            let signed = ctx
                .run(async {
                    Ok(self
                        .federation
                        .send_invite(&invitee_server, version, event.clone())
                        .await?)
                })
                .await?;
            if signed.event_id() != event.event_id() || !signed.verify_id() {
                return Err(RoomserverError::RemoteNegotiationFailed(format!(
                    "{invitee_server} returned a different invite event"
                )));
            }
            event = signed;
        }

        let event_id = event.event_id().clone();
        let mut input = InputRoomEvent::new(InputKind::New, event);
        if let Some(txn) = &req.transaction_id {
            input = input.with_transaction_id(txn.clone());
        }
        self.inputer.input_event(ctx, input).await?;
        info!(room_id = %req.room_id, invitee = %req.invitee, "Invited user");

        Ok(PerformInviteResponse {
            event_id: Some(event_id),
            ..Default::default()
        })
    }
}
