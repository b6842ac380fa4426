//! Event type names and the state key tuple.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known event types.
pub mod event_type {
    pub const CREATE: &str = "m.room.create";
    pub const MEMBER: &str = "m.room.member";
    pub const POWER_LEVELS: &str = "m.room.power_levels";
    pub const JOIN_RULES: &str = "m.room.join_rules";
    pub const SERVER_ACL: &str = "m.room.server_acl";
    pub const HISTORY_VISIBILITY: &str = "m.room.history_visibility";
    pub const THIRD_PARTY_INVITE: &str = "m.room.third_party_invite";
    pub const NAME: &str = "m.room.name";
    pub const TOPIC: &str = "m.room.topic";
    pub const MESSAGE: &str = "m.room.message";
    pub const REDACTION: &str = "m.room.redaction";
}

/// The `(event type, state key)` slot a state event occupies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKeyTuple {
    pub event_type: String,
    pub state_key: String,
}

impl StateKeyTuple {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }

    /// Tuple with an empty state key (`m.room.create`, `m.room.power_levels`, ...).
    pub fn room(event_type: impl Into<String>) -> Self {
        Self::new(event_type, "")
    }

    pub fn is(&self, event_type: &str, state_key: &str) -> bool {
        self.event_type == event_type && self.state_key == state_key
    }
}

impl fmt::Display for StateKeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.event_type, self.state_key)
    }
}
