use std::sync::Arc;

use anyhow::{Context, Result};
use cubehost::{
    config::Config,
    files::FileManager,
    ports::PortAllocator,
    runtime::{ContainerRuntime, DockerClient},
    store::{MemoryStore, Store},
    tasks::Lifecycle,
    worker::{ApiServer, Dispatcher},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(err) => error!(error = %err, "Could not listen for ctrl-c"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!(
        data_root = %config.data_root.display(),
        port_floor = config.port_range.floor,
        port_ceiling = config.port_range.ceiling,
        workers = config.workers,
        listen_addr = %config.listen_addr,
        "Configuration loaded"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerClient::connect(config.docker_socket.as_deref())
            .context("connecting to the container engine")?,
    );
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let ports = Arc::new(PortAllocator::new(config.port_range));

    let lifecycle = Arc::new(Lifecycle::new(
        runtime.clone(),
        store.clone(),
        ports,
        config.lifecycle(),
    ));
    lifecycle
        .restore_ports()
        .await
        .context("restoring port allocations")?;

    let (dispatcher, workers) = Dispatcher::start(store.clone(), lifecycle, config.dispatcher());
    let files = Arc::new(FileManager::new(runtime, store, config.file_policy()));

    ApiServer::new(dispatcher, files)
        .serve(&config.listen_addr, shutdown_signal())
        .await
        .context("serving HTTP API")?;

    // The API held the last dispatcher handle; workers drain the queue and exit.
    for handle in workers {
        if let Err(err) = handle.await {
            error!(error = %err, "Worker task ended abnormally");
        }
    }
    info!("Shut down cleanly");
    Ok(())
}
