//! Cachecast daemon entry point.

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

use cachecast::config::{Config, DiscoverySource};
use cachecast::discovery::{Discovery, DockerDiscovery, StaticDiscovery};
use cachecast::purge::PurgeHandler;
use cachecast::registry::AddressRegistry;
use cachecast::server::{router, run_server};
use cachecast::sync::MembershipSync;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting cachecast with config: {:?}", cfg);

    let registry = AddressRegistry::new();

    // Discovery event channel
    let (event_tx, event_rx) = mpsc::channel(128);

    let discovery: Box<dyn Discovery + Send + Sync> = match cfg.discovery {
        DiscoverySource::Docker => Box::new(DockerDiscovery::new(
            cfg.docker.network_name.clone(),
            cfg.docker.label_selector.clone(),
            cfg.docker.group_label.clone(),
            cfg.docker.target_ports.clone(),
        )),
        DiscoverySource::Static => Box::new(StaticDiscovery::parse(&cfg.static_endpoints)?),
    };
    let discovery_handle = tokio::spawn(async move {
        if let Err(e) = discovery.watch(event_tx).await {
            error!("Discovery failed: {}", e);
        }
    });

    // Refuse to serve until the registry reflects a full listing.
    let sync_handle = match MembershipSync::new(registry.clone())
        .start(event_rx, cfg.sync_timeout())
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            error!("Membership sync failed: {}", e);
            discovery_handle.abort();
            return Err(e.into());
        }
    };

    // HTTP Server
    let client = PurgeHandler::client(
        cfg.request_timeout(),
        cfg.idle_timeout(),
        cfg.max_idle_per_host,
    )?;
    let handler = PurgeHandler::new(client, registry, cfg.outbound_method()?);
    let app = router(handler, cfg.broadcast_methods()?, cfg.server_timeout());
    let listen = cfg.listen;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = run_server(listen, app).await {
            error!("HTTP server failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    server_handle.abort();
    sync_handle.abort();
    discovery_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
