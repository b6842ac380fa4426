//! Room server ACLs.
//!
//! A room's `m.room.server_acl` state decides which servers may participate.
//! Compiled ACLs are cached per room; the input pipeline replaces an entry
//! whenever ACL state changes, and rooms not yet seen are loaded from current
//! state on first lookup.

use crate::storage::{Database, StorageError};
use dashmap::DashMap;
use regex::Regex;
use slroom_proto::{
    Event, Membership, RoomId, ServerAclContent, ServerName, StateKeyTuple, UserId,
    compile_glob, event_type,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// A compiled `m.room.server_acl`.
#[derive(Debug, Clone)]
pub struct ServerAcl {
    allow_ip_literals: bool,
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl ServerAcl {
    /// Compile ACL content. Patterns that fail to compile are skipped.
    pub fn from_content(content: &ServerAclContent) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|p| match compile_glob(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern = %p, error = %e, "Skipping invalid server ACL pattern");
                        None
                    }
                })
                .collect()
        };
        Self {
            allow_ip_literals: content.allow_ip_literals,
            allow: compile(&content.allow),
            deny: compile(&content.deny),
        }
    }

    /// Whether `server` may participate. The port is ignored, deny wins over
    /// allow, and an empty allow list admits nobody.
    pub fn is_allowed(&self, server: &ServerName) -> bool {
        if server.is_ip_literal() && !self.allow_ip_literals {
            return false;
        }
        let host = server.host();
        if self.deny.iter().any(|re| re.is_match(host)) {
            return false;
        }
        self.allow.iter().any(|re| re.is_match(host))
    }
}

/// Whether an inbound event bypasses the ACL: a server may always tell us its
/// own user has left.
pub fn is_exempt(event: &Event, origin: &ServerName) -> bool {
    if !event.is_type(event_type::MEMBER) {
        return false;
    }
    let leaving = matches!(event.membership(), Ok(Some(Membership::Leave)));
    leaving
        && event
            .state_key()
            .and_then(|k| UserId::parse(k).ok())
            .is_some_and(|user| &user.server_name() == origin)
}

/// Per-room ACL cache.
pub struct ServerAcls {
    db: Arc<dyn Database>,
    local: ServerName,
    acls: DashMap<RoomId, Option<Arc<ServerAcl>>>,
}

impl ServerAcls {
    pub fn new(db: Arc<dyn Database>, local: ServerName) -> Self {
        Self {
            db,
            local,
            acls: DashMap::new(),
        }
    }

    /// Whether `server` is denied by the ACL of `room_id`. Rooms without an
    /// ACL deny nobody, and the local server is never denied.
    pub async fn is_server_banned_from_room(&self, server: &ServerName, room_id: &RoomId) -> bool {
        if server == &self.local {
            return false;
        }
        let cached = self.acls.get(room_id).map(|entry| entry.value().clone());
        let acl = match cached {
            Some(acl) => acl,
            None => match self.load(room_id).await {
                Ok(loaded) => self
                    .acls
                    .entry(room_id.clone())
                    .or_insert(loaded)
                    .value()
                    .clone(),
                Err(e) => {
                    warn!(room_id = %room_id, error = %e, "Failed to load server ACL");
                    return false;
                }
            },
        };
        let banned = acl.is_some_and(|acl| !acl.is_allowed(server));
        if banned {
            debug!(room_id = %room_id, server = %server, "Server denied by room ACL");
        }
        banned
    }

    /// Replace the cached ACL after a state change. `None` clears it.
    pub fn on_acl_state(&self, room_id: &RoomId, event: Option<&Event>) {
        let acl = event.and_then(|e| match ServerAclContent::from_value(e.content()) {
            Ok(content) => Some(Arc::new(ServerAcl::from_content(&content))),
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "Ignoring malformed server ACL");
                None
            }
        });
        self.acls.insert(room_id.clone(), acl);
    }

    async fn load(&self, room_id: &RoomId) -> Result<Option<Arc<ServerAcl>>, StorageError> {
        let Some(room) = self.db.room(room_id).await? else {
            return Ok(None);
        };
        let Some(snapshot) = self.db.snapshot(&room.current_state).await? else {
            return Ok(None);
        };
        let Some(event_id) = snapshot.get(&StateKeyTuple::room(event_type::SERVER_ACL)) else {
            return Ok(None);
        };
        let Some(stored) = self.db.event(event_id).await? else {
            return Ok(None);
        };
        Ok(ServerAclContent::from_value(stored.event.content())
            .ok()
            .map(|content| Arc::new(ServerAcl::from_content(&content))))
    }
}
