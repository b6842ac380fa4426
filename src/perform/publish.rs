//! Room directory visibility.

use super::Performers;
use crate::api::{PerformPublishRequest, PerformPublishResponse, Visibility};
use crate::error::RoomserverError;
use tracing::info;

impl Performers {
    pub async fn perform_publish(
        &self,
        req: &PerformPublishRequest,
    ) -> Result<PerformPublishResponse, RoomserverError> {
        self.queryer.room(&req.room_id).await?;
        self.db
            .set_published(&req.room_id, req.visibility == Visibility::Public)
            .await?;
        info!(room_id = %req.room_id, visibility = ?req.visibility, "Room visibility set");
        Ok(PerformPublishResponse::default())
    }
}
