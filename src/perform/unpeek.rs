//! Ending a local peek.

use super::{PeekMachine, Performed, Performers};
use crate::api::{PerformUnpeekRequest, PerformUnpeekResponse};
use crate::error::RoomserverError;
use crate::storage::PeekRecord;
use tracing::info;

impl Performers {
    pub async fn perform_unpeek(
        &self,
        req: &PerformUnpeekRequest,
    ) -> Result<Performed<PerformUnpeekResponse>, RoomserverError> {
        self.require_local(&req.user_id)?;
        let removed = self
            .db
            .remove_peek(&req.room_id, &req.user_id, &req.device_id)
            .await?;
        if !removed {
            return Err(RoomserverError::BadRequest(format!(
                "{} is not peeking {} from device {}",
                req.user_id, req.room_id, req.device_id
            )));
        }

        let stopped = PeekMachine::resume(&PeekRecord {
            room_id: req.room_id.clone(),
            user_id: req.user_id.clone(),
            device_id: req.device_id.clone(),
            created_at: 0,
        })
        .stop();
        info!(room_id = %req.room_id, user_id = %req.user_id, device_id = %req.device_id, "Stopped peeking");
        Ok(Performed::new(PerformUnpeekResponse::default()).with_output(stopped.retired()))
    }
}
