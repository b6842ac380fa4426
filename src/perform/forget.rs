//! Forgetting rooms.

use super::Performers;
use crate::api::{PerformForgetRequest, PerformForgetResponse};
use crate::error::RoomserverError;

impl Performers {
    /// Drop the user's membership record. Purely local. The check and the
    /// purge run inside the room's input turn.
    pub async fn perform_forget(
        &self,
        req: &PerformForgetRequest,
    ) -> Result<PerformForgetResponse, RoomserverError> {
        self.require_local(&req.user_id)?;
        self.inputer.forget(&req.room_id, &req.user_id).await?;
        Ok(PerformForgetResponse::default())
    }
}
