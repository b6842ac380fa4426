//! Room events.
//!
//! An [`Event`] is an immutable node in a room's DAG. Its [`EventId`] is a
//! SHA-256 digest over the canonical JSON form of the event with
//! `event_id`, `signatures` and `unsigned` stripped, so the id is a pure
//! function of the content. Signatures are carried opaquely and never
//! participate in the id.

use crate::content::{ContentError, Membership, MemberContent};
use crate::id::{EventId, RoomId, ServerName, UserId};
use crate::types::{event_type, StateKeyTuple};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Signatures keyed by server name, then key id.
pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event id {claimed} does not match content hash {computed}")]
    IdMismatch { claimed: EventId, computed: EventId },
}

/// An immutable room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    event_id: EventId,
    room_id: RoomId,
    sender: UserId,
    origin: ServerName,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_key: Option<String>,
    content: Value,
    prev_events: Vec<EventId>,
    auth_events: Vec<EventId>,
    depth: u64,
    origin_server_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    redacts: Option<EventId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    signatures: Signatures,
}

impl Event {
    /// Parse an event from JSON and check that its id matches its content.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EventError> {
        let event: Event = serde_json::from_slice(bytes)?;
        let computed = event.compute_id();
        if computed != event.event_id {
            return Err(EventError::IdMismatch {
                claimed: event.event_id,
                computed,
            });
        }
        Ok(event)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn sender(&self) -> &UserId {
        &self.sender
    }

    /// Server that created the event.
    pub fn origin(&self) -> &ServerName {
        &self.origin
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn prev_events(&self) -> &[EventId] {
        &self.prev_events
    }

    pub fn auth_events(&self) -> &[EventId] {
        &self.auth_events
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn origin_server_ts(&self) -> i64 {
        self.origin_server_ts
    }

    pub fn redacts(&self) -> Option<&EventId> {
        self.redacts.as_ref()
    }

    pub fn signatures(&self) -> &Signatures {
        &self.signatures
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// The state slot this event occupies, if it is a state event.
    pub fn state_key_tuple(&self) -> Option<StateKeyTuple> {
        self.state_key
            .as_ref()
            .map(|key| StateKeyTuple::new(self.event_type.clone(), key.clone()))
    }

    pub fn is_state_of(&self, event_type: &str, state_key: &str) -> bool {
        self.event_type == event_type && self.state_key.as_deref() == Some(state_key)
    }

    /// Deserialize the content into a typed struct.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.content.clone())
    }

    /// Membership carried by an `m.room.member` event.
    pub fn membership(&self) -> Result<Option<Membership>, ContentError> {
        if self.event_type != event_type::MEMBER || self.state_key.is_none() {
            return Ok(None);
        }
        MemberContent::from_value(&self.content).map(|c| Some(c.membership))
    }

    /// Target of a membership event, parsed from the state key.
    pub fn membership_target(&self) -> Option<UserId> {
        if self.event_type != event_type::MEMBER {
            return None;
        }
        self.state_key.as_deref().and_then(|k| UserId::parse(k).ok())
    }

    /// Whether the id still matches the content.
    pub fn verify_id(&self) -> bool {
        self.compute_id() == self.event_id
    }

    /// Return a copy carrying an extra signature. The id is unaffected.
    pub fn with_signature(&self, server: &ServerName, key_id: &str, signature: &str) -> Event {
        let mut signed = self.clone();
        signed
            .signatures
            .entry(server.to_string())
            .or_default()
            .insert(key_id.to_string(), signature.to_string());
        signed
    }

    fn compute_id(&self) -> EventId {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("event_id");
            map.remove("signatures");
            map.remove("unsigned");
        }
        let canonical = canonical_json(&value);
        let digest = Sha256::digest(canonical.as_bytes());
        EventId::from_digest(&URL_SAFE_NO_PAD.encode(digest))
    }
}

/// Encode a JSON value with object keys sorted and no insignificant
/// whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ============================================================================
// EventBuilder
// ============================================================================

/// Assembles an [`Event`] and computes its id.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    room_id: RoomId,
    sender: UserId,
    event_type: String,
    state_key: Option<String>,
    content: Value,
    prev_events: Vec<EventId>,
    auth_events: Vec<EventId>,
    depth: u64,
    origin: Option<ServerName>,
    origin_server_ts: Option<i64>,
    redacts: Option<EventId>,
}

impl EventBuilder {
    pub fn new(room_id: RoomId, sender: UserId, event_type: impl Into<String>, content: Value) -> Self {
        Self {
            room_id,
            sender,
            event_type: event_type.into(),
            state_key: None,
            content,
            prev_events: Vec::new(),
            auth_events: Vec::new(),
            depth: 1,
            origin: None,
            origin_server_ts: None,
            redacts: None,
        }
    }

    pub fn state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn prev_events(mut self, prev_events: Vec<EventId>) -> Self {
        self.prev_events = prev_events;
        self
    }

    pub fn auth_events(mut self, auth_events: Vec<EventId>) -> Self {
        self.auth_events = auth_events;
        self
    }

    pub fn depth(mut self, depth: u64) -> Self {
        self.depth = depth;
        self
    }

    pub fn origin(mut self, origin: ServerName) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn origin_server_ts(mut self, ts: i64) -> Self {
        self.origin_server_ts = Some(ts);
        self
    }

    pub fn redacts(mut self, redacts: EventId) -> Self {
        self.redacts = Some(redacts);
        self
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn sender(&self) -> &UserId {
        &self.sender
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn get_state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Finish the event. Origin defaults to the sender's server and the
    /// timestamp to now.
    pub fn build(self) -> Event {
        let origin = self.origin.unwrap_or_else(|| self.sender.server_name());
        let mut event = Event {
            event_id: EventId::from_digest("pending"),
            room_id: self.room_id,
            sender: self.sender,
            origin,
            event_type: self.event_type,
            state_key: self.state_key,
            content: self.content,
            prev_events: self.prev_events,
            auth_events: self.auth_events,
            depth: self.depth,
            origin_server_ts: self
                .origin_server_ts
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            redacts: self.redacts,
            signatures: Signatures::new(),
        };
        event.event_id = event.compute_id();
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder() -> EventBuilder {
        EventBuilder::new(
            RoomId::parse("!r:a.example").unwrap(),
            UserId::parse("@alice:a.example").unwrap(),
            event_type::MESSAGE,
            json!({"body": "hi", "msgtype": "m.text"}),
        )
        .origin_server_ts(1000)
    }

    #[test]
    fn id_is_deterministic() {
        assert_eq!(builder().build().event_id(), builder().build().event_id());
    }

    #[test]
    fn id_changes_with_content() {
        let a = builder().build();
        let b = builder().depth(2).build();
        assert_ne!(a.event_id(), b.event_id());
    }

    #[test]
    fn signatures_do_not_change_id() {
        let event = builder().build();
        let signed = event.with_signature(&ServerName::parse("a.example").unwrap(), "ed25519:1", "sig");
        assert_eq!(event.event_id(), signed.event_id());
        assert!(signed.verify_id());
    }

    #[test]
    fn from_json_rejects_tampered_content() {
        let event = builder().build();
        let mut value = serde_json::to_value(&event).unwrap();
        value["content"]["body"] = json!("tampered");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(Event::from_json(&bytes), Err(EventError::IdMismatch { .. })));
        assert!(Event::from_json(&event.to_json().unwrap()).is_ok());
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
    }

    #[test]
    fn member_event_exposes_membership() {
        let event = EventBuilder::new(
            RoomId::parse("!r:a.example").unwrap(),
            UserId::parse("@bob:b.example").unwrap(),
            event_type::MEMBER,
            json!({"membership": "join"}),
        )
        .state_key("@bob:b.example")
        .build();
        assert_eq!(event.membership().unwrap(), Some(Membership::Join));
        assert_eq!(event.membership_target().unwrap().as_str(), "@bob:b.example");
        assert_eq!(event.origin().as_str(), "b.example");
    }
}
