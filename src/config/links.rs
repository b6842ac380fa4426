//! Peer servers hosted in the same process.

use serde::Deserialize;

/// A peer server that runs alongside the primary one and is reachable over
/// the loopback federation network. Peers always use in-memory storage.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkBlock {
    /// Peer server name (e.g., "b.straylight.net").
    pub name: String,
}
