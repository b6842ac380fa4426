//! Integration test common infrastructure.
//!
//! Provides utilities for building roomservers, linking them over the
//! loopback network, and writing room events on top of current state.

pub mod room;
pub mod servers;

#[allow(unused_imports)]
pub use room::TestRoom;
#[allow(unused_imports)]
pub use servers::{TestNetwork, single_server};

use slroom_proto::{RoomId, ServerName, UserId};

#[allow(dead_code)]
pub fn user(s: &str) -> UserId {
    UserId::parse(s).expect("valid user id")
}

#[allow(dead_code)]
pub fn room_id(s: &str) -> RoomId {
    RoomId::parse(s).expect("valid room id")
}

#[allow(dead_code)]
pub fn server_name(s: &str) -> ServerName {
    ServerName::parse(s).expect("valid server name")
}
