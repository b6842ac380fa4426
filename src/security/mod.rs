//! Security module for slroomd.
//!
//! - **ACL**: per-room server access lists applied to inbound federation
//!   traffic and to invites sent out

pub mod acl;

pub use acl::{ServerAcl, ServerAcls, is_exempt};
