//! Typed views over the content of well-known state events.
//!
//! Content is stored on events as raw JSON; these types are parsed on demand
//! by the authorization rules, the ACL guard and the query engine.

use crate::id::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while interpreting event content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("malformed {event_type} content: {reason}")]
    Malformed {
        event_type: &'static str,
        reason: String,
    },
}

fn malformed(event_type: &'static str, err: impl ToString) -> ContentError {
    ContentError::Malformed {
        event_type,
        reason: err.to_string(),
    }
}

// ============================================================================
// Membership
// ============================================================================

/// Membership state of a user in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Ban => "ban",
            Self::Knock => "knock",
        }
    }
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of `m.room.member`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberContent {
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Joined user vouching for a restricted join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_authorised_via_users_server: Option<UserId>,
}

impl MemberContent {
    pub fn new(membership: Membership) -> Self {
        Self {
            membership,
            displayname: None,
            reason: None,
            join_authorised_via_users_server: None,
        }
    }

    pub fn from_value(content: &Value) -> Result<Self, ContentError> {
        serde_json::from_value(content.clone()).map_err(|e| malformed("m.room.member", e))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Create
// ============================================================================

/// Content of `m.room.create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,
    #[serde(rename = "m.federate", default = "default_true")]
    pub federate: bool,
}

fn default_true() -> bool {
    true
}

impl CreateContent {
    pub fn from_value(content: &Value) -> Result<Self, ContentError> {
        serde_json::from_value(content.clone()).map_err(|e| malformed("m.room.create", e))
    }
}

// ============================================================================
// Join rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRule {
    Public,
    Invite,
    Knock,
    Restricted,
    KnockRestricted,
    Private,
}

/// Content of `m.room.join_rules`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRulesContent {
    pub join_rule: JoinRule,
}

impl JoinRulesContent {
    pub fn from_value(content: &Value) -> Result<Self, ContentError> {
        serde_json::from_value(content.clone()).map_err(|e| malformed("m.room.join_rules", e))
    }
}

// ============================================================================
// History visibility
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryVisibility {
    Invited,
    Joined,
    Shared,
    WorldReadable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryVisibilityContent {
    pub history_visibility: HistoryVisibility,
}

impl HistoryVisibilityContent {
    pub fn from_value(content: &Value) -> Result<Self, ContentError> {
        serde_json::from_value(content.clone())
            .map_err(|e| malformed("m.room.history_visibility", e))
    }
}

// ============================================================================
// Server ACL
// ============================================================================

/// Content of `m.room.server_acl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAclContent {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_ip_literals: bool,
}

impl ServerAclContent {
    pub fn from_value(content: &Value) -> Result<Self, ContentError> {
        serde_json::from_value(content.clone()).map_err(|e| malformed("m.room.server_acl", e))
    }
}

// ============================================================================
// Power levels
// ============================================================================

/// Parsed `m.room.power_levels` content with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowerLevelsContent {
    pub ban: i64,
    pub kick: i64,
    pub invite: i64,
    pub redact: i64,
    pub events_default: i64,
    pub state_default: i64,
    pub users_default: i64,
    pub events: BTreeMap<String, i64>,
    pub users: BTreeMap<UserId, i64>,
}

impl PowerLevelsContent {
    /// Levels that apply when a room has no power levels event: the creator
    /// holds 100, everyone else 0, and state needs no privilege.
    pub fn without_event(creator: Option<&UserId>) -> Self {
        let mut users = BTreeMap::new();
        if let Some(creator) = creator {
            users.insert(creator.clone(), 100);
        }
        Self {
            ban: 50,
            kick: 50,
            invite: 0,
            redact: 50,
            events_default: 0,
            state_default: 0,
            users_default: 0,
            events: BTreeMap::new(),
            users,
        }
    }

    /// Parse content. With `integers_only` set, string-encoded levels are
    /// rejected instead of coerced.
    pub fn from_value(content: &Value, integers_only: bool) -> Result<Self, ContentError> {
        let obj = content
            .as_object()
            .ok_or_else(|| malformed("m.room.power_levels", "content is not an object"))?;

        let level = |key: &str, default: i64| -> Result<i64, ContentError> {
            match obj.get(key) {
                None => Ok(default),
                Some(v) => parse_level(v, integers_only).ok_or_else(|| {
                    malformed("m.room.power_levels", format!("{key} is not a valid level"))
                }),
            }
        };

        let mut events = BTreeMap::new();
        if let Some(map) = obj.get("events") {
            let map = map
                .as_object()
                .ok_or_else(|| malformed("m.room.power_levels", "events is not an object"))?;
            for (event_type, v) in map {
                let lvl = parse_level(v, integers_only).ok_or_else(|| {
                    malformed("m.room.power_levels", format!("events.{event_type} invalid"))
                })?;
                events.insert(event_type.clone(), lvl);
            }
        }

        let mut users = BTreeMap::new();
        if let Some(map) = obj.get("users") {
            let map = map
                .as_object()
                .ok_or_else(|| malformed("m.room.power_levels", "users is not an object"))?;
            for (user, v) in map {
                let user = UserId::parse(user.as_str())
                    .map_err(|e| malformed("m.room.power_levels", e))?;
                let lvl = parse_level(v, integers_only).ok_or_else(|| {
                    malformed("m.room.power_levels", format!("users.{user} invalid"))
                })?;
                users.insert(user, lvl);
            }
        }

        Ok(Self {
            ban: level("ban", 50)?,
            kick: level("kick", 50)?,
            invite: level("invite", 0)?,
            redact: level("redact", 50)?,
            events_default: level("events_default", 0)?,
            state_default: level("state_default", 50)?,
            users_default: level("users_default", 0)?,
            events,
            users,
        })
    }

    pub fn user_level(&self, user: &UserId) -> i64 {
        self.users.get(user).copied().unwrap_or(self.users_default)
    }

    /// Level needed to send an event of this type.
    pub fn event_level(&self, event_type: &str, is_state: bool) -> i64 {
        match self.events.get(event_type) {
            Some(level) => *level,
            None if is_state => self.state_default,
            None => self.events_default,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn parse_level(v: &Value, integers_only: bool) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if !integers_only => s.trim().parse().ok(),
        _ => None,
    }
}
