//! Authorization checker.
//!
//! Decides whether an event is allowed given a state map. Everything here is
//! pure: the caller supplies the relevant state through [`AuthStateProvider`]
//! and gets back either `Ok(())` or the reason the event is not allowed.
//!
//! - [`is_authorized`]: the room rules (create, membership, power levels)
//! - [`auth_types_for_event`]: which state an event needs to be authorized
//! - [`check_auth_events`]: structural checks on an event's own auth events

mod rules;

pub use rules::is_authorized;

use crate::state::{EventMap, StateMap};
use serde_json::Value;
use slroom_proto::{
    ContentError, Event, EventId, MemberContent, Membership, StateKeyTuple, UserId, event_type,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Why an event is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no m.room.create event in state")]
    MissingCreateEvent,
    #[error("m.room.create must not have prev events")]
    CreateHasPrevEvents,
    #[error("m.room.create sender is not on the room's server")]
    CreateWrongDomain,
    #[error("m.room.create must have an empty state key")]
    CreateStateKey,
    #[error("unsupported room version {0:?}")]
    UnsupportedRoomVersion(String),
    #[error("event belongs to a different room than its state")]
    WrongRoom,
    #[error("room is not federated and the sender is remote")]
    NotFederated,
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("membership event has an invalid state key")]
    InvalidStateKey,
    #[error("sender is not joined to the room")]
    SenderNotJoined,
    #[error("sender power level {actual} is below the required {required}")]
    InsufficientPower { required: i64, actual: i64 },
    #[error("state key {0} names a user other than the sender")]
    StateKeyNotSender(String),
    #[error("membership change not allowed: {0}")]
    Membership(&'static str),
    #[error("power level change not allowed: {0}")]
    PowerLevels(String),
    #[error("auth events invalid: {0}")]
    AuthEvents(String),
}

/// Read access to the state an event is authorized against.
pub trait AuthStateProvider {
    fn get_state(&self, event_type: &str, state_key: &str) -> Option<&Event>;

    fn create_event(&self) -> Option<&Event> {
        self.get_state(event_type::CREATE, "")
    }

    fn power_levels_event(&self) -> Option<&Event> {
        self.get_state(event_type::POWER_LEVELS, "")
    }

    fn join_rules_event(&self) -> Option<&Event> {
        self.get_state(event_type::JOIN_RULES, "")
    }

    fn member_event(&self, user: &UserId) -> Option<&Event> {
        self.get_state(event_type::MEMBER, user.as_str())
    }
}

/// State events keyed by tuple, borrowed from wherever they were loaded.
#[derive(Debug, Default, Clone)]
pub struct AuthEventSet<'a> {
    events: BTreeMap<StateKeyTuple, &'a Event>,
}

impl<'a> AuthEventSet<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from state events. Later events replace earlier ones in the same slot.
    pub fn from_events(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut set = Self::new();
        for event in events {
            set.insert(event);
        }
        set
    }

    /// Look up the events for the given tuples of `state`. Missing events are
    /// returned as an error.
    pub fn from_state(
        state: &StateMap,
        tuples: &[StateKeyTuple],
        events: &'a EventMap,
    ) -> Result<Self, Vec<EventId>> {
        let mut set = Self::new();
        let mut missing = Vec::new();
        for tuple in tuples {
            if let Some(id) = state.get(tuple) {
                match events.get(id) {
                    Some(event) => set.insert(event),
                    None => missing.push(id.clone()),
                }
            }
        }
        if missing.is_empty() {
            Ok(set)
        } else {
            Err(missing)
        }
    }

    pub fn insert(&mut self, event: &'a Event) {
        if let Some(tuple) = event.state_key_tuple() {
            self.events.insert(tuple, event);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl AuthStateProvider for AuthEventSet<'_> {
    fn get_state(&self, event_type: &str, state_key: &str) -> Option<&Event> {
        self.events
            .get(&StateKeyTuple::new(event_type, state_key))
            .copied()
    }
}

/// The state tuples an event of this shape needs for authorization.
pub fn auth_types_for(
    event_type: &str,
    state_key: Option<&str>,
    sender: &UserId,
    content: &Value,
) -> Vec<StateKeyTuple> {
    if event_type == event_type::CREATE {
        return Vec::new();
    }

    let mut tuples = BTreeSet::new();
    tuples.insert(StateKeyTuple::room(event_type::CREATE));
    tuples.insert(StateKeyTuple::room(event_type::POWER_LEVELS));
    tuples.insert(StateKeyTuple::new(event_type::MEMBER, sender.as_str()));

    if event_type == event_type::MEMBER
        && let Some(key) = state_key
    {
        tuples.insert(StateKeyTuple::new(event_type::MEMBER, key));
        if let Ok(member) = MemberContent::from_value(content) {
            if matches!(
                member.membership,
                Membership::Join | Membership::Invite | Membership::Knock
            ) {
                tuples.insert(StateKeyTuple::room(event_type::JOIN_RULES));
            }
            if member.membership == Membership::Join
                && let Some(via) = member.join_authorised_via_users_server
            {
                tuples.insert(StateKeyTuple::new(event_type::MEMBER, via.as_str()));
            }
        }
    }

    tuples.into_iter().collect()
}

/// The state tuples `event` needs for authorization.
pub fn auth_types_for_event(event: &Event) -> Vec<StateKeyTuple> {
    auth_types_for(
        event.event_type(),
        event.state_key(),
        event.sender(),
        event.content(),
    )
}

/// Structural checks on the events `event` cites as its auth events: each must
/// be a state event of a type the event needs, in the same room, with no slot
/// cited twice. A create event must cite nothing.
pub fn check_auth_events(event: &Event, auth_events: &[&Event]) -> Result<(), AuthError> {
    if event.is_type(event_type::CREATE) {
        if !auth_events.is_empty() || !event.auth_events().is_empty() {
            return Err(AuthError::AuthEvents("create event cites auth events".into()));
        }
        return Ok(());
    }

    let allowed: BTreeSet<StateKeyTuple> = auth_types_for_event(event).into_iter().collect();
    let mut seen = BTreeSet::new();
    for auth in auth_events {
        if auth.room_id() != event.room_id() {
            return Err(AuthError::AuthEvents(format!(
                "{} is from another room",
                auth.event_id()
            )));
        }
        let tuple = auth.state_key_tuple().ok_or_else(|| {
            AuthError::AuthEvents(format!("{} is not a state event", auth.event_id()))
        })?;
        if !allowed.contains(&tuple) {
            return Err(AuthError::AuthEvents(format!(
                "{} occupies {tuple}, which is not needed",
                auth.event_id()
            )));
        }
        if !seen.insert(tuple.clone()) {
            return Err(AuthError::AuthEvents(format!("{tuple} cited twice")));
        }
    }

    if !seen.contains(&StateKeyTuple::room(event_type::CREATE)) {
        return Err(AuthError::MissingCreateEvent);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use slroom_proto::{EventBuilder, RoomId};

    fn room() -> RoomId {
        RoomId::parse("!r:a.example").unwrap()
    }

    fn alice() -> UserId {
        UserId::parse("@alice:a.example").unwrap()
    }

    #[test]
    fn create_needs_nothing() {
        assert!(auth_types_for(event_type::CREATE, Some(""), &alice(), &json!({})).is_empty());
    }

    #[test]
    fn join_needs_join_rules_and_authoriser() {
        let bob = UserId::parse("@bob:b.example").unwrap();
        let tuples = auth_types_for(
            event_type::MEMBER,
            Some(bob.as_str()),
            &bob,
            &json!({"membership": "join", "join_authorised_via_users_server": "@alice:a.example"}),
        );
        assert!(tuples.contains(&StateKeyTuple::room(event_type::JOIN_RULES)));
        assert!(tuples.contains(&StateKeyTuple::new(event_type::MEMBER, "@alice:a.example")));
        assert!(tuples.contains(&StateKeyTuple::new(event_type::MEMBER, "@bob:b.example")));
    }

    #[test]
    fn leave_does_not_need_join_rules() {
        let tuples = auth_types_for(
            event_type::MEMBER,
            Some("@alice:a.example"),
            &alice(),
            &json!({"membership": "leave"}),
        );
        assert!(!tuples.contains(&StateKeyTuple::room(event_type::JOIN_RULES)));
    }

    #[test]
    fn check_auth_events_rejects_unneeded_slots() {
        let create = EventBuilder::new(room(), alice(), event_type::CREATE, json!({"room_version": "10"}))
            .state_key("")
            .build();
        let topic = EventBuilder::new(room(), alice(), event_type::TOPIC, json!({"topic": "t"}))
            .state_key("")
            .build();
        let message = EventBuilder::new(room(), alice(), event_type::MESSAGE, json!({"body": "x"}))
            .auth_events(vec![create.event_id().clone(), topic.event_id().clone()])
            .build();
        assert!(check_auth_events(&message, &[&create]).is_ok());
        assert!(matches!(
            check_auth_events(&message, &[&create, &topic]),
            Err(AuthError::AuthEvents(_))
        ));
        assert!(matches!(
            check_auth_events(&message, &[&create, &create]),
            Err(AuthError::AuthEvents(_))
        ));
        assert_eq!(check_auth_events(&message, &[]), Err(AuthError::MissingCreateEvent));
    }
}
