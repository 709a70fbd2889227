use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::watcher;
use tracing::{debug, info};

use super::dispatcher::{Handler, ObjectKey};
use crate::convert;
use crate::convert::evaluate::{is_evaluate_job, EVALUATE_APP_LABEL};
use crate::store::ObjectStorageBackend;
use crate::Result;

pub const KIND: &str = "EvaluateJob";

pub struct EvaluateJobHandler {
    store: Arc<dyn ObjectStorageBackend>,
}

impl EvaluateJobHandler {
    pub fn new(store: Arc<dyn ObjectStorageBackend>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for EvaluateJobHandler {
    type Object = Job;

    fn kind(&self) -> &str {
        KIND
    }

    fn watcher_configs(&self) -> Vec<watcher::Config> {
        let selector = format!("{}={}", EVALUATE_APP_LABEL.0, EVALUATE_APP_LABEL.1);
        vec![watcher::Config::default().labels(&selector)]
    }

    async fn sync(&self, key: &ObjectKey, live: Option<Job>) -> Result<()> {
        match live {
            None => {
                info!("Evaluate job {}/{} deleted", key.namespace, key.name);
                self.store
                    .delete_evaluate_job(&key.namespace, &key.name, &key.uid)
                    .await
            }
            Some(job) if !is_evaluate_job(&job) => {
                debug!("Skipping job {}/{}, not an evaluation", key.namespace, key.name);
                Ok(())
            }
            Some(job) => self.store.write_evaluate_job(convert::evaluate::convert(&job)?).await,
        }
    }
}
