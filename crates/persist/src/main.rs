use std::sync::Arc;
use tracing::{error, info};

use devconsole_persist::{
    backends::{self, Registry},
    config::Config,
    controllers::{self, job::JOB_KINDS},
    metrics,
    server::Server,
    tenant::{ClientCache, ClusterUsers},
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut config = Config::load()?;
    if config.database.max_connections.is_none() {
        let workers = config.controller.total_workers(JOB_KINDS.len());
        config.database.max_connections = Some(workers as u32);
    }
    info!("Loaded configuration: {:?}", config);

    metrics::register_metrics();

    let client = kube::Client::try_default().await?;
    let registry = Arc::new(Registry::new());

    let store =
        backends::object_backend_named(&config.backends.object_storage, &config.database).await?;
    if let Some(store) = store {
        registry.register_object(store);
    }
    let clients = Arc::new(ClientCache::new(client.clone(), config.tenant.kubeconfig_dir.clone()));
    backends::register_configured(&registry, &config.backends, &client, clients)?;

    let server = Server::new(&config, registry.clone());
    let addr = config.server.addr.clone();
    let server_task = tokio::spawn(async move { server.start(&addr).await });

    let users = Arc::new(ClusterUsers::new(client.clone()));
    let result = controllers::run_all(
        client,
        &registry,
        &config.backends,
        &config.controller,
        users,
    )
    .await;

    if let Err(e) = &result {
        error!("Dispatchers failed: {}", e);
        return result;
    }

    // Persistence may be disabled; keep serving health and metrics.
    match server_task.await {
        Ok(served) => served,
        Err(e) => Err(devconsole_persist::Error::Internal(format!("server task: {}", e))),
    }
}
