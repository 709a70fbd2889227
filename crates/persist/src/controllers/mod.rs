pub mod cron;
pub mod dispatcher;
pub mod evaluate;
pub mod job;
pub mod notebook;
pub mod pod;

pub use dispatcher::{Dispatcher, Handler, ObjectKey, Request};

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use kube::Client;
use tracing::{info, warn};

use crate::backends::Registry;
use crate::config::{BackendConfig, ControllerConfig};
use crate::crd::training::{
    MPI_JOB_KIND, PYTORCH_JOB_KIND, TF_JOB_KIND, XDL_JOB_KIND, XGBOOST_JOB_KIND,
};
use crate::store::ObjectStorageBackend;
use crate::tenant::UserDirectory;
use crate::Result;

use self::cron::CronHandler;
use self::evaluate::EvaluateJobHandler;
use self::job::{
    JobHandler, MPIJobAdapter, PyTorchJobAdapter, TFJobAdapter, XDLJobAdapter, XGBoostJobAdapter,
};
use self::notebook::NotebookHandler;
use self::pod::PodHandler;

fn dispatch<H: Handler>(
    client: &Client,
    handler: H,
    workers: usize,
    config: &ControllerConfig,
) -> BoxFuture<'static, Result<()>> {
    Dispatcher::new(client.clone(), handler, workers, config).run().boxed()
}

/// Dispatcher for a job kind, `None` for kinds without an adapter.
pub fn job_dispatcher(
    kind: &str,
    client: &Client,
    store: Arc<dyn ObjectStorageBackend>,
    config: &ControllerConfig,
) -> Option<BoxFuture<'static, Result<()>>> {
    let workers = config.max_concurrent_reconciles;
    let region = config.region.clone();
    let run = match kind {
        TF_JOB_KIND => {
            let handler = JobHandler::<TFJobAdapter>::new(store, region);
            dispatch(client, handler, workers, config)
        }
        PYTORCH_JOB_KIND => {
            let handler = JobHandler::<PyTorchJobAdapter>::new(store, region);
            dispatch(client, handler, workers, config)
        }
        XDL_JOB_KIND => {
            let handler = JobHandler::<XDLJobAdapter>::new(store, region);
            dispatch(client, handler, workers, config)
        }
        XGBOOST_JOB_KIND => {
            let handler = JobHandler::<XGBoostJobAdapter>::new(store, region);
            dispatch(client, handler, workers, config)
        }
        MPI_JOB_KIND => {
            let handler = JobHandler::<MPIJobAdapter>::new(store, region);
            dispatch(client, handler, workers, config)
        }
        _ => return None,
    };
    Some(run)
}

/// Runs every dispatcher until they all stop.
pub async fn run_all(
    client: Client,
    registry: &Registry,
    backends: &BackendConfig,
    config: &ControllerConfig,
    users: Arc<dyn UserDirectory>,
) -> Result<()> {
    if backends.object_storage.is_empty() {
        info!("No object storage configured, persistence is disabled");
        return Ok(());
    }
    let store = registry.object_backend(&backends.object_storage)?;
    let workers = config.max_concurrent_reconciles;

    let mut runs: Vec<BoxFuture<'static, Result<()>>> = Vec::new();
    for kind in job::JOB_KINDS {
        match job_dispatcher(kind, &client, store.clone(), config) {
            Some(run) => runs.push(run),
            None => warn!("No adapter registered for job kind {}", kind),
        }
    }
    runs.push(dispatch(&client, PodHandler::new(store.clone()), config.pod_workers(), config));
    let crons = CronHandler::new(store.clone(), config.region.clone());
    runs.push(dispatch(&client, crons, workers, config));
    runs.push(dispatch(&client, NotebookHandler::new(store.clone(), users), workers, config));
    runs.push(dispatch(&client, EvaluateJobHandler::new(store), workers, config));

    info!("Starting {} dispatchers backed by {}", runs.len(), backends.object_storage);
    future::try_join_all(runs).await?;
    Ok(())
}
