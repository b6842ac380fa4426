//! Validated identifiers for servers, rooms, users and events.
//!
//! All identifiers are cheap newtypes around `String` that are validated
//! once on construction. They serialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of any identifier in bytes.
pub const MAX_ID_LEN: usize = 255;

/// Errors raised while parsing an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier {0:?} must start with '{1}'")]
    MissingSigil(String, char),
    #[error("identifier {0:?} has no server name")]
    MissingServerName(String),
    #[error("identifier {0:?} has an empty localpart")]
    EmptyLocalpart(String),
    #[error("invalid server name: {0:?}")]
    InvalidServerName(String),
    #[error("identifier is too long ({0} bytes)")]
    TooLong(usize),
}

// ============================================================================
// ServerName
// ============================================================================

/// A server name, optionally carrying a port (`example.org:8448`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerName(String);

impl ServerName {
    /// Parse and validate a server name.
    pub fn parse(s: impl Into<String>) -> Result<Self, IdParseError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdParseError::Empty);
        }
        if s.len() > MAX_ID_LEN {
            return Err(IdParseError::TooLong(s.len()));
        }
        let valid = s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
        if !valid || s.starts_with(':') {
            return Err(IdParseError::InvalidServerName(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host part with any port stripped.
    pub fn host(&self) -> &str {
        if self.0.starts_with('[') {
            return match self.0.find(']') {
                Some(end) => &self.0[..=end],
                None => &self.0,
            };
        }
        match self.0.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                host
            }
            _ => &self.0,
        }
    }

    /// Whether the host is a literal IPv4 or bracketed IPv6 address.
    pub fn is_ip_literal(&self) -> bool {
        let host = self.host();
        if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            return inner.parse::<Ipv6Addr>().is_ok();
        }
        host.parse::<Ipv4Addr>().is_ok()
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerName {
    type Err = IdParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerName {
    type Error = IdParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<ServerName> for String {
    fn from(id: ServerName) -> Self {
        id.0
    }
}

// ============================================================================
// Sigiled identifiers with a server part
// ============================================================================

macro_rules! server_scoped_id {
    ($(#[$meta:meta])* $name:ident, $sigil:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Sigil character that prefixes this identifier.
            pub const SIGIL: char = $sigil;

            /// Parse and validate the identifier.
            pub fn parse(s: impl Into<String>) -> Result<Self, IdParseError> {
                let s = s.into();
                if s.is_empty() {
                    return Err(IdParseError::Empty);
                }
                if s.len() > MAX_ID_LEN {
                    return Err(IdParseError::TooLong(s.len()));
                }
                if !s.starts_with($sigil) {
                    return Err(IdParseError::MissingSigil(s, $sigil));
                }
                let Some((local, server)) = s[1..].split_once(':') else {
                    return Err(IdParseError::MissingServerName(s));
                };
                if local.is_empty() {
                    return Err(IdParseError::EmptyLocalpart(s));
                }
                ServerName::parse(server)?;
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Part between the sigil and the first colon.
            pub fn localpart(&self) -> &str {
                self.0[1..].split_once(':').map(|(l, _)| l).unwrap_or_default()
            }

            /// Server the identifier was minted on.
            pub fn server_name(&self) -> ServerName {
                let server = self.0[1..].split_once(':').map(|(_, s)| s).unwrap_or_default();
                ServerName(server.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdParseError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

server_scoped_id!(
    /// Room identifier (`!opaque:server`).
    RoomId,
    '!'
);

server_scoped_id!(
    /// User identifier (`@localpart:server`).
    UserId,
    '@'
);

// ============================================================================
// EventId
// ============================================================================

/// Content-derived event identifier (`$` followed by an unpadded URL-safe
/// base64 SHA-256 digest).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    pub const SIGIL: char = '$';

    pub fn parse(s: impl Into<String>) -> Result<Self, IdParseError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdParseError::Empty);
        }
        if s.len() > MAX_ID_LEN {
            return Err(IdParseError::TooLong(s.len()));
        }
        if !s.starts_with(Self::SIGIL) {
            return Err(IdParseError::MissingSigil(s, Self::SIGIL));
        }
        if s.len() == 1 {
            return Err(IdParseError::EmptyLocalpart(s));
        }
        Ok(Self(s))
    }

    /// Build an id from an already-encoded digest.
    pub(crate) fn from_digest(encoded: &str) -> Self {
        Self(format!("${encoded}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EventId {
    type Err = IdParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EventId {
    type Error = IdParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn user_id_splits_localpart_and_server() {
        let user = UserId::parse("@alice:a.example:8448").unwrap();
        assert_eq!(user.localpart(), "alice");
        assert_eq!(user.server_name().as_str(), "a.example:8448");
    }

    #[test]
    fn room_id_requires_sigil_and_server() {
        assert!(matches!(
            RoomId::parse("room:a.example"),
            Err(IdParseError::MissingSigil(_, '!'))
        ));
        assert!(matches!(
            RoomId::parse("!room"),
            Err(IdParseError::MissingServerName(_))
        ));
        assert!(RoomId::parse("!room:a.example").is_ok());
    }

    #[test]
    fn server_name_host_strips_port() {
        assert_eq!(ServerName::parse("a.example:8448").unwrap().host(), "a.example");
        assert_eq!(ServerName::parse("[::1]:8448").unwrap().host(), "[::1]");
        assert_eq!(ServerName::parse("a.example").unwrap().host(), "a.example");
    }

    #[test]
    fn server_name_detects_ip_literals() {
        assert!(ServerName::parse("10.0.0.1:80").unwrap().is_ip_literal());
        assert!(ServerName::parse("[::1]").unwrap().is_ip_literal());
        assert!(!ServerName::parse("a.example").unwrap().is_ip_literal());
    }

    #[test]
    fn server_name_rejects_garbage() {
        assert!(ServerName::parse("bad server").is_err());
        assert!(ServerName::parse("").is_err());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let room = RoomId::parse("!r:a.example").unwrap();
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"!r:a.example\"");
        let back: RoomId = serde_json::from_str("\"!r:a.example\"").unwrap();
        assert_eq!(back, room);
        assert!(serde_json::from_str::<RoomId>("\"nope\"").is_err());
    }

    proptest! {
        #[test]
        fn parsed_user_ids_keep_their_server(local in "[a-z0-9_]{1,20}", host in "[a-z]{1,10}\\.[a-z]{2,5}") {
            let raw = format!("@{local}:{host}");
            let user = UserId::parse(raw.clone()).unwrap();
            prop_assert_eq!(user.as_str(), raw.as_str());
            let server = user.server_name();
            prop_assert_eq!(server.as_str(), host.as_str());
            prop_assert_eq!(user.localpart(), local.as_str());
        }
    }
}
