use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::dispatcher::{Handler, ObjectKey};
use crate::convert;
use crate::crd::Cron;
use crate::store::ObjectStorageBackend;
use crate::Result;

pub const KIND: &str = "Cron";

pub struct CronHandler {
    store: Arc<dyn ObjectStorageBackend>,
    region: String,
}

impl CronHandler {
    pub fn new(store: Arc<dyn ObjectStorageBackend>, region: impl Into<String>) -> Self {
        Self {
            store,
            region: region.into(),
        }
    }
}

#[async_trait]
impl Handler for CronHandler {
    type Object = Cron;

    fn kind(&self) -> &str {
        KIND
    }

    async fn sync(&self, key: &ObjectKey, live: Option<Cron>) -> Result<()> {
        match live {
            None => {
                info!("Cron {}/{} deleted", key.namespace, key.name);
                self.store.delete_cron(&key.namespace, &key.name, &key.uid).await
            }
            Some(cron) => {
                let record = convert::cron::convert(&cron, &self.region)?;
                self.store.write_cron(record).await
            }
        }
    }
}
