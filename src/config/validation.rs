//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::{Config, StorageBackend};
use slroom_proto::ServerName;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("server.name is not a valid server name: {0}")]
    InvalidServerName(String),
    #[error("server.perspective_servers contains an invalid server name: {0}")]
    InvalidPerspectiveServer(String),
    #[error("storage.path parent directory does not exist: {0}")]
    StoragePathInvalid(String),
    #[error("input.room_queue_capacity must be greater than zero")]
    ZeroQueueCapacity,
    #[error("backfill.max_limit must be greater than zero")]
    ZeroBackfillLimit,
    #[error("links entry has an invalid server name: {0}")]
    InvalidLinkName(String),
    #[error("links entry {0} duplicates another server")]
    DuplicateLink(String),
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.name.is_empty() {
        errors.push(ValidationError::MissingServerName);
    } else if ServerName::parse(config.server.name.as_str()).is_err() {
        errors.push(ValidationError::InvalidServerName(config.server.name.clone()));
    }

    for server in &config.server.perspective_servers {
        if ServerName::parse(server.as_str()).is_err() {
            errors.push(ValidationError::InvalidPerspectiveServer(server.clone()));
        }
    }

    if config.storage.backend == StorageBackend::Redb {
        let path = Path::new(&config.storage.path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            errors.push(ValidationError::StoragePathInvalid(config.storage.path.clone()));
        }
    }

    if config.input.room_queue_capacity == 0 {
        errors.push(ValidationError::ZeroQueueCapacity);
    }
    if config.backfill.max_limit == 0 {
        errors.push(ValidationError::ZeroBackfillLimit);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(config.server.name.as_str());
    for link in &config.links {
        if ServerName::parse(link.name.as_str()).is_err() {
            errors.push(ValidationError::InvalidLinkName(link.name.clone()));
        } else if !seen.insert(link.name.as_str()) {
            errors.push(ValidationError::DuplicateLink(link.name.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkBlock;

    fn base() -> Config {
        Config::for_server(&ServerName::parse("a.example").unwrap())
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = base();
        config.server.name = String::new();
        config.input.room_queue_capacity = 0;
        config.backfill.max_limit = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn rejects_duplicate_links() {
        let mut config = base();
        config.links = vec![
            LinkBlock { name: "b.example".into() },
            LinkBlock { name: "b.example".into() },
            LinkBlock { name: "a.example".into() },
        ];
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::DuplicateLink(_))));
    }
}
