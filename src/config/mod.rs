//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Core config struct definitions (Config, ServerConfig)
//! - [`storage`]: Storage backend selection (StorageConfig)
//! - [`input`]: Input pipeline and backfill tuning (InputConfig, BackfillConfig)
//! - [`links`]: In-process peer servers reachable over the loopback network (LinkBlock)

mod input;
mod links;
mod storage;
mod types;
mod validation;

pub use input::{BackfillConfig, InputConfig};
pub use links::LinkBlock;
pub use storage::{StorageBackend, StorageConfig};
pub use types::{Config, ConfigError, LogFormat, ServerConfig};
pub use validation::{ValidationError, validate};
