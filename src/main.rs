use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use fleetq::config::WorkerConfig;
use fleetq::docker::{ContainerRuntime, DockerClient};
use fleetq::kv::{EtcdClient, KvStore};
use fleetq::metadata;
use fleetq::shutdown::install_shutdown_handler;
use fleetq::worker::Worker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env()?;

    tracing::info!(endpoint = %config.kv_endpoint, "connecting to KV store");
    let kv: Arc<dyn KvStore> = Arc::new(EtcdClient::connect(&config.kv_endpoint).await?);

    tracing::info!(endpoint = %config.docker_endpoint, "connecting to container runtime");
    let docker: Arc<dyn ContainerRuntime> =
        Arc::new(DockerClient::connect(&config.docker_endpoint).await?);

    tracing::info!("reading instance metadata");
    let identity = metadata::detect().await;

    let worker = Worker::new(config, identity, kv, docker).await?;
    install_shutdown_handler(worker.signal_sender());

    tracing::info!(worker_id = %worker.id(), "starting worker");
    worker.run().await;

    Ok(())
}
