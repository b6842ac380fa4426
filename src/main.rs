//! slroomd - Straylight Room Daemon
//!
//! Runs a roomserver, plus any `[[links]]` peers in the same process joined
//! over the loopback federation network.

use slroomd::config::{self, Config, LogFormat, StorageBackend};
use slroomd::federation::{FederationApi, LoopbackNetwork, NoFederation};
use slroomd::storage::Database;
use slroomd::storage::memory::MemoryDatabase;
use slroomd::storage::redb::RedbDatabase;
use slroomd::{Roomserver, http, metrics};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "slroomd.toml".to_string());
    let config = Config::load(&config_path)?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.server.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }

    if let Err(errors) = config::validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        return Err(anyhow::anyhow!(
            "{} configuration error(s) in {config_path}",
            errors.len()
        ));
    }

    info!(server = %config.server.name, "Starting slroomd");

    let db: Arc<dyn Database> = match config.storage.backend {
        StorageBackend::Redb => {
            info!(path = %config.storage.path, "Opening redb storage");
            Arc::new(RedbDatabase::new(&config.storage.path)?)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; room state is lost on exit");
            Arc::new(MemoryDatabase::new())
        }
    };

    let links = config.links.clone();
    let metrics_port = config.server.metrics_port.unwrap_or(9090);
    let primary = Arc::new(Roomserver::new(config, db)?);
    let mut servers = vec![Arc::clone(&primary)];

    if links.is_empty() {
        primary
            .attach_federation(Arc::new(NoFederation) as Arc<dyn FederationApi>)
            .await?;
    } else {
        let network = LoopbackNetwork::new();
        for link in &links {
            let peer = Roomserver::new(
                Config::for_server(&slroom_proto::ServerName::parse(link.name.as_str())?),
                Arc::new(MemoryDatabase::new()),
            )?;
            servers.push(Arc::new(peer));
        }
        for server in &servers {
            network.register(server);
        }
        for server in &servers {
            server
                .attach_federation(network.client(server.server_name().clone()))
                .await?;
            info!(server = %server.server_name(), "Linked over loopback federation");
        }
    }

    let shutdown = CancellationToken::new();

    // Prometheus metrics are optional.
    // Convention: metrics_port = 0 disables the HTTP endpoint (used by tests).
    if metrics_port == 0 {
        info!("Metrics disabled");
    } else {
        metrics::init();
        let token = shutdown.clone();
        tokio::spawn(async move {
            http::run_http_server(metrics_port, token).await;
        });
        info!(port = metrics_port, "Prometheus HTTP server started");
    }

    // Log committed output so operators can follow room changes.
    for server in &servers {
        let mut outputs = server.outputs();
        let name = server.server_name().clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    record = outputs.recv() => match record {
                        Ok(record) => info!(
                            server = %name,
                            room_id = %record.room_id,
                            seq = record.seq,
                            kind = record.event.kind(),
                            "Output"
                        ),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(server = %name, skipped = n, "Output log lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();
    Ok(())
}
