//! # slroom-proto
//!
//! Data model shared by every part of slroomd: validated identifiers,
//! content-addressed room events, typed views over well-known state content,
//! room versions and the server-name globs used by room ACLs.
//!
//! ## Quick Start
//!
//! ```rust
//! use slroom_proto::{EventBuilder, RoomId, UserId, event_type};
//! use serde_json::json;
//!
//! let room = RoomId::parse("!lobby:a.example").unwrap();
//! let alice = UserId::parse("@alice:a.example").unwrap();
//! let create = EventBuilder::new(room, alice.clone(), event_type::CREATE, json!({"creator": alice}))
//!     .state_key("")
//!     .build();
//!
//! assert!(create.is_state());
//! assert!(create.verify_id());
//! ```

#![deny(clippy::all)]

pub mod content;
pub mod event;
pub mod glob;
pub mod id;
pub mod room_version;
pub mod types;

pub use self::content::{
    ContentError, CreateContent, HistoryVisibility, HistoryVisibilityContent, JoinRule,
    JoinRulesContent, MemberContent, Membership, PowerLevelsContent, ServerAclContent,
};
pub use self::event::{canonical_json, Event, EventBuilder, EventError, Signatures};
pub use self::glob::compile_glob;
pub use self::id::{EventId, IdParseError, RoomId, ServerName, UserId};
pub use self::room_version::{RoomVersion, RoomVersionRules, StateResAlgorithm, UnsupportedRoomVersion};
pub use self::types::{event_type, StateKeyTuple};
