//! Test server management.
//!
//! Builds roomservers with in-memory storage and fast retry settings.

use super::server_name;
use slroomd::Roomserver;
use slroomd::config::Config;
use slroomd::federation::{LoopbackNetwork, NoFederation};
use slroomd::storage::Database;
use slroomd::storage::memory::MemoryDatabase;
use std::sync::Arc;

/// Config for a test server: memory storage, no metrics, quick retries.
#[allow(dead_code)]
pub fn test_config(name: &str) -> Config {
    let mut config = Config::for_server(&server_name(name));
    config.input.retry_backoff_ms = 1;
    config.input.max_missing_retries = 2;
    config.backfill.server_timeout_secs = 2;
    config
}

/// A standalone server with no federation.
#[allow(dead_code)]
pub async fn single_server(name: &str) -> anyhow::Result<Arc<Roomserver>> {
    single_server_with(test_config(name), Arc::new(MemoryDatabase::new())).await
}

#[allow(dead_code)]
pub async fn single_server_with(
    config: Config,
    db: Arc<dyn Database>,
) -> anyhow::Result<Arc<Roomserver>> {
    let server = Arc::new(Roomserver::new(config, db)?);
    server.attach_federation(Arc::new(NoFederation)).await?;
    Ok(server)
}

/// Several servers that can reach each other.
#[allow(dead_code)]
pub struct TestNetwork {
    pub network: Arc<LoopbackNetwork>,
    pub servers: Vec<Arc<Roomserver>>,
}

#[allow(dead_code)]
impl TestNetwork {
    pub async fn start(names: &[&str]) -> anyhow::Result<Self> {
        Self::start_with(names.iter().map(|n| test_config(n)).collect()).await
    }

    pub async fn start_with(configs: Vec<Config>) -> anyhow::Result<Self> {
        let network = LoopbackNetwork::new();
        let mut servers = Vec::new();
        for config in configs {
            let server = Arc::new(Roomserver::new(config, Arc::new(MemoryDatabase::new()))?);
            network.register(&server);
            servers.push(server);
        }
        for server in &servers {
            server
                .attach_federation(network.client(server.server_name().clone()))
                .await?;
        }
        Ok(Self { network, servers })
    }

    pub fn server(&self, index: usize) -> &Arc<Roomserver> {
        &self.servers[index]
    }
}
