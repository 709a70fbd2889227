pub mod apiserver;
pub mod registry;

pub use apiserver::{ApiServerActionBackend, ApiServerEventBackend};
pub use registry::Registry;
pub use crate::store::ObjectStorageBackend;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::api::DynamicObject;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::BackendConfig;
use crate::store::{self, DatabaseConfig};
use crate::tenant::ClientCache;
use crate::{Error, Result};

/// Cluster event as shown next to a job or pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventRecord {
    pub name: String,
    pub kind: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub obj_namespace: String,
    pub obj_name: String,
    pub obj_uid: String,
    pub reason: String,
    pub message: String,
    pub count: i32,
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Read access to events and container logs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBackend: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn name(&self) -> &'static str;

    /// Events of objects whose name starts with `object_name`, ordered by
    /// resource version.
    async fn list_events(
        &self,
        namespace: &str,
        object_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>>;

    async fn list_logs(
        &self,
        namespace: &str,
        pod: &str,
        max_lines: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>>;
}

/// Mutating operations on workloads, performed on behalf of a user.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionBackend: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn name(&self) -> &'static str;

    /// Copy of this backend that acts with `user`'s credentials.
    async fn with_user(&self, user: &str) -> Result<Arc<dyn ActionBackend>>;

    async fn submit_job(&self, job: DynamicObject) -> Result<()>;

    /// Deletes the job if it is still the incarnation `uid` names. An empty
    /// `uid` matches any incarnation.
    async fn stop_job(&self, namespace: &str, name: &str, uid: &str, kind: &str) -> Result<()>;
    async fn submit_evaluate_job(&self, job: Job) -> Result<()>;
    async fn delete_evaluate_job(&self, namespace: &str, name: &str) -> Result<()>;
    async fn suspend_cron(&self, namespace: &str, name: &str, uid: &str) -> Result<()>;
    async fn resume_cron(&self, namespace: &str, name: &str, uid: &str) -> Result<()>;
    async fn stop_cron(&self, namespace: &str, name: &str, uid: &str) -> Result<()>;
}

/// Event backend called `name`. An empty name disables events.
pub fn event_backend_named(name: &str, client: &Client) -> Result<Option<Arc<dyn EventBackend>>> {
    match name {
        "" => Ok(None),
        apiserver::NAME => Ok(Some(Arc::new(ApiServerEventBackend::new(client.clone())))),
        other => Err(Error::Config(format!("unknown event backend {:?}", other))),
    }
}

/// Action backend called `name`. An empty name disables actions.
pub fn action_backend_named(
    name: &str,
    client: &Client,
    clients: Arc<ClientCache>,
) -> Result<Option<Arc<dyn ActionBackend>>> {
    match name {
        "" => Ok(None),
        apiserver::NAME => {
            let backend = ApiServerActionBackend::new(client.clone(), Some(clients));
            Ok(Some(Arc::new(backend)))
        }
        other => Err(Error::Config(format!("unknown action backend {:?}", other))),
    }
}

/// Object store called `name`, connected and migrated. An empty name
/// disables persistence.
pub async fn object_backend_named(
    name: &str,
    database: &DatabaseConfig,
) -> Result<Option<Arc<dyn ObjectStorageBackend>>> {
    match name {
        "" => Ok(None),
        store::SQLITE => Ok(Some(store::create_store(database).await?)),
        other => Err(Error::Config(format!("unknown object storage {:?}", other))),
    }
}

/// Registers the event and action backends named in `config`. Nothing is
/// registered when either name is unknown.
pub fn register_configured(
    registry: &Registry,
    config: &BackendConfig,
    client: &Client,
    clients: Arc<ClientCache>,
) -> Result<()> {
    let events = event_backend_named(&config.event_storage, client)?;
    let actions = action_backend_named(&config.action, client, clients)?;

    match events {
        Some(backend) => registry.register_event(backend),
        None => info!("No event storage configured, events are disabled"),
    }
    match actions {
        Some(backend) => registry.register_action(backend),
        None => info!("No action backend configured, actions are disabled"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn client() -> Client {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    fn clients(client: &Client) -> Arc<ClientCache> {
        Arc::new(ClientCache::new(client.clone(), std::env::temp_dir()))
    }

    #[tokio::test]
    async fn test_register_configured_backends() {
        let client = client();
        let registry = Registry::new();
        let config = Config::default().backends;

        register_configured(&registry, &config, &client, clients(&client)).unwrap();
        assert_eq!(registry.event_backend("apiserver").unwrap().name(), "apiserver");
        assert_eq!(registry.action_backend("apiserver").unwrap().name(), "apiserver");
    }

    #[tokio::test]
    async fn test_empty_names_disable_backends() {
        let client = client();
        let registry = Registry::new();
        let mut config = Config::default().backends;
        config.event_storage = String::new();
        config.action = String::new();

        register_configured(&registry, &config, &client, clients(&client)).unwrap();
        assert!(registry.event_backend("apiserver").is_err());
        assert!(registry.action_backend("apiserver").is_err());
    }

    #[tokio::test]
    async fn test_unknown_names_rejected() {
        let client = client();
        let registry = Registry::new();

        let mut config = Config::default().backends;
        config.event_storage = "elasticsearch".to_string();
        let err = register_configured(&registry, &config, &client, clients(&client)).err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        let mut config = Config::default().backends;
        config.action = "arena".to_string();
        let err = register_configured(&registry, &config, &client, clients(&client)).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(registry.event_backend("apiserver").is_err());
        assert!(registry.action_backend("apiserver").is_err());
    }

    #[tokio::test]
    async fn test_object_backend_by_name() {
        let database = DatabaseConfig::in_memory();

        let store = object_backend_named("sqlite", &database).await.unwrap().unwrap();
        assert_eq!(store.name(), "sqlite");

        assert!(object_backend_named("", &database).await.unwrap().is_none());
        let err = object_backend_named("mysql", &database).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
