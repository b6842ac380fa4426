//! Request and response types for every performer and query.
//!
//! Responses never fail as a whole: an operation that did not succeed
//! returns a default response with `error` set to the kind and message.

mod perform;
mod query;

pub use perform::*;
pub use query::*;

use crate::error::{PerformError, RoomserverError};
use crate::input::{InputOutcome, InputRoomEvent};
use serde::{Deserialize, Serialize};
use slroom_proto::RoomId;

/// Common behaviour of response types.
pub trait ApiResponse: Default {
    fn error(&self) -> Option<&PerformError>;

    fn set_error(&mut self, error: PerformError);

    /// An empty response carrying `err`.
    fn failed(err: &RoomserverError) -> Self {
        let mut response = Self::default();
        response.set_error(PerformError::from(err));
        response
    }

    /// `Err` with the error if one is set.
    fn into_result(self) -> Result<Self, PerformError> {
        match self.error().cloned() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

macro_rules! api_response {
    ($($name:ident),* $(,)?) => {
        $(
            impl $crate::api::ApiResponse for $name {
                fn error(&self) -> Option<&$crate::error::PerformError> {
                    self.error.as_ref()
                }

                fn set_error(&mut self, error: $crate::error::PerformError) {
                    self.error = Some(error);
                }
            }
        )*
    };
}
pub(crate) use api_response;

// ============================================================================
// Input
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRoomEventsRequest {
    pub room_id: RoomId,
    pub events: Vec<InputRoomEvent>,
    /// Queue the events and return without waiting for them.
    #[serde(default)]
    pub asynchronous: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputRoomEventsResponse {
    pub outcomes: Vec<InputOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PerformError>,
}

api_response!(InputRoomEventsResponse);
