//! slroomd - Straylight Room Daemon
//!
//! The authoritative room-state component of a federated group messaging
//! server: it accepts room events, checks them against the authorization
//! rules, resolves conflicting state, and answers membership and state
//! queries for the rest of the server.
//!
//! The entry point is [`Roomserver`]. Build one per server name, attach a
//! [`federation::FederationApi`] and start submitting events.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod federation;
pub mod http;
pub mod input;
pub mod metrics;
pub mod output;
pub mod perform;
pub mod query;
pub mod reporting;
pub mod resolution;
pub mod roomserver;
pub mod security;
pub mod state;
pub mod storage;
pub mod telemetry;

pub use context::RequestContext;
pub use error::{ErrorKind, PerformError, RoomserverError};
pub use roomserver::Roomserver;
