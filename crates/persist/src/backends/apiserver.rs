use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams,
    Preconditions,
};
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

use super::{ActionBackend, EventBackend, EventRecord};
use crate::crd::training::api_resource;
use crate::crd::Cron;
use crate::tenant::ClientCache;
use crate::{Error, Result};

pub const NAME: &str = "apiserver";
const DEFAULT_NAMESPACE: &str = "default";

fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

/// Treats a 404 as success.
fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether `live` is the incarnation named by `uid`. An empty `uid` matches
/// any incarnation.
fn is_target(uid: &str, live: &ObjectMeta) -> bool {
    uid.is_empty() || live.uid.as_deref() == Some(uid)
}

/// Delete that fails on the server if the object was replaced meanwhile.
fn delete_params(uid: &str) -> DeleteParams {
    DeleteParams {
        preconditions: (!uid.is_empty()).then(|| Preconditions {
            uid: Some(uid.to_string()),
            resource_version: None,
        }),
        ..Default::default()
    }
}

fn event_time(event: &Event) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

fn to_record(event: &Event) -> EventRecord {
    let obj = &event.involved_object;
    EventRecord {
        name: event.metadata.name.clone().unwrap_or_default(),
        kind: obj.kind.clone().unwrap_or_default(),
        type_: event.type_.clone().unwrap_or_default(),
        obj_namespace: obj.namespace.clone().unwrap_or_default(),
        obj_name: obj.name.clone().unwrap_or_default(),
        obj_uid: obj.uid.clone().unwrap_or_default(),
        reason: event.reason.clone().unwrap_or_default(),
        message: event.message.clone().unwrap_or_default(),
        count: event.count.unwrap_or(1),
        last_timestamp: event_time(event),
    }
}

/// Keeps events of objects named `object_name*` within `[from, to]`. Events
/// without any timestamp are kept.
fn select_events(
    events: Vec<Event>,
    object_name: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<EventRecord> {
    let mut selected: Vec<(u64, EventRecord)> = events
        .iter()
        .filter(|e| {
            e.involved_object
                .name
                .as_deref()
                .map_or(false, |n| n.starts_with(object_name))
        })
        .filter(|e| event_time(e).map_or(true, |t| t >= from && t <= to))
        .map(|e| {
            let version = e
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_default();
            (version, to_record(e))
        })
        .collect();
    selected.sort_by_key(|(version, _)| *version);
    selected.into_iter().map(|(_, record)| record).collect()
}

/// Events and logs read straight from the API server.
#[derive(Clone)]
pub struct ApiServerEventBackend {
    client: Client,
}

impl ApiServerEventBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventBackend for ApiServerEventBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        NAME
    }

    async fn list_events(
        &self,
        namespace: &str,
        object_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace_or_default(namespace));
        let events = api.list(&ListParams::default()).await?;
        let selected = select_events(events.items, object_name, from, to);
        debug!("Found {} events for {}/{}", selected.len(), namespace, object_name);
        Ok(selected)
    }

    async fn list_logs(
        &self,
        namespace: &str,
        pod: &str,
        max_lines: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace_or_default(namespace));
        let params = LogParams {
            tail_lines: max_lines,
            since_seconds: since.map(|t| (Utc::now() - t).num_seconds().max(1)),
            ..Default::default()
        };
        let logs = api.logs(pod, &params).await?;
        Ok(logs.lines().map(str::to_string).collect())
    }
}

/// Applies user actions through the API server, with the process
/// credentials or a tenant's.
#[derive(Clone)]
pub struct ApiServerActionBackend {
    client: Client,
    clients: Option<Arc<ClientCache>>,
}

impl ApiServerActionBackend {
    pub fn new(client: Client, clients: Option<Arc<ClientCache>>) -> Self {
        Self { client, clients }
    }

    fn jobs(&self, namespace: &str, kind: &str) -> Result<Api<DynamicObject>> {
        let resource = api_resource(kind)
            .ok_or_else(|| Error::Validation(format!("unsupported job kind {}", kind)))?;
        Ok(Api::namespaced_with(self.client.clone(), namespace_or_default(namespace), &resource))
    }

    fn crons(&self, namespace: &str) -> Api<Cron> {
        Api::namespaced(self.client.clone(), namespace_or_default(namespace))
    }

    async fn set_suspend(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        suspend: bool,
    ) -> Result<()> {
        let api = self.crons(namespace);
        let live = api
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cron {}/{}", namespace, name)))?;
        if !is_target(uid, &live.metadata) {
            return Err(Error::NotFound(format!("cron {}/{} with uid {}", namespace, name, uid)));
        }

        let patch = json!({ "spec": { "suspend": suspend } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        info!("Set suspend={} on cron {}/{}", suspend, namespace, name);
        Ok(())
    }
}

#[async_trait]
impl ActionBackend for ApiServerActionBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        NAME
    }

    async fn with_user(&self, user: &str) -> Result<Arc<dyn ActionBackend>> {
        let clients = self
            .clients
            .as_ref()
            .ok_or_else(|| Error::Config("tenant client cache is not configured".to_string()))?;
        let client = clients.client_for_user(user).await?;
        Ok(Arc::new(Self::new(client, None)))
    }

    async fn submit_job(&self, job: DynamicObject) -> Result<()> {
        let kind = job
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .ok_or_else(|| Error::Validation("job manifest has no kind".to_string()))?;
        let namespace = job.metadata.namespace.clone().unwrap_or_default();
        let created = self
            .jobs(&namespace, &kind)?
            .create(&PostParams::default(), &job)
            .await?;
        info!(
            "Submitted {} {}/{}",
            kind,
            namespace_or_default(&namespace),
            created.metadata.name.unwrap_or_default()
        );
        Ok(())
    }

    async fn stop_job(&self, namespace: &str, name: &str, uid: &str, kind: &str) -> Result<()> {
        let api = self.jobs(namespace, kind)?;
        let Some(live) = api.get_opt(name).await? else {
            debug!("{} {}/{} is already gone", kind, namespace, name);
            return Ok(());
        };
        if !is_target(uid, &live.metadata) {
            info!("Not stopping {} {}/{}: {} was already replaced", kind, namespace, name, uid);
            return Ok(());
        }

        ignore_not_found(api.delete(name, &delete_params(uid)).await)?;
        info!("Stopped {} {}/{}", kind, namespace, name);
        Ok(())
    }

    async fn submit_evaluate_job(&self, job: Job) -> Result<()> {
        let namespace = job.metadata.namespace.clone().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace_or_default(&namespace));
        api.create(&PostParams::default(), &job).await?;
        Ok(())
    }

    async fn delete_evaluate_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace_or_default(namespace));
        ignore_not_found(api.delete(name, &DeleteParams::background()).await)
    }

    async fn suspend_cron(&self, namespace: &str, name: &str, uid: &str) -> Result<()> {
        self.set_suspend(namespace, name, uid, true).await
    }

    async fn resume_cron(&self, namespace: &str, name: &str, uid: &str) -> Result<()> {
        self.set_suspend(namespace, name, uid, false).await
    }

    async fn stop_cron(&self, namespace: &str, name: &str, uid: &str) -> Result<()> {
        let api = self.crons(namespace);
        let Some(live) = api.get_opt(name).await? else {
            return Ok(());
        };
        if !is_target(uid, &live.metadata) {
            info!("Not stopping cron {}/{}: {} was already replaced", namespace, name, uid);
            return Ok(());
        }
        ignore_not_found(api.delete(name, &delete_params(uid)).await)
    }
}
