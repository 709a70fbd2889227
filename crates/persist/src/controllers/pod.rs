use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use tracing::debug;

use super::dispatcher::{Handler, ObjectKey};
use crate::convert::pod::{controller_owner, replica_type, REPLICA_TYPE_LABELS};
use crate::convert;
use crate::crd::training::api_resource;
use crate::store::ObjectStorageBackend;
use crate::Result;

pub const KIND: &str = "Pod";

/// Whether the pod is a replica of a training job.
pub fn is_job_replica(pod: &Pod) -> bool {
    let owned_by_job = controller_owner(pod).map_or(false, |o| api_resource(&o.kind).is_some());
    owned_by_job && replica_type(pod).is_some()
}

pub struct PodHandler {
    store: Arc<dyn ObjectStorageBackend>,
}

impl PodHandler {
    pub fn new(store: Arc<dyn ObjectStorageBackend>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for PodHandler {
    type Object = Pod;

    fn kind(&self) -> &str {
        KIND
    }

    /// Only pods carrying one of the replica type labels.
    fn watcher_configs(&self) -> Vec<watcher::Config> {
        REPLICA_TYPE_LABELS
            .iter()
            .map(|key| watcher::Config::default().labels(key))
            .collect()
    }

    async fn sync(&self, key: &ObjectKey, live: Option<Pod>) -> Result<()> {
        let Some(pod) = live else {
            return self
                .store
                .update_pod_record_stopped(&key.namespace, &key.name, &key.uid)
                .await;
        };

        if !is_job_replica(&pod) {
            debug!("Skipping pod {}/{}, not a job replica", key.namespace, key.name);
            return Ok(());
        }

        let record = convert::pod::convert(&pod, Utc::now())?;
        if pod.metadata.deletion_timestamp.is_some() {
            self.store
                .update_pod_record_stopped(&key.namespace, &key.name, &key.uid)
                .await?;
        }
        self.store.write_pod(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::REPLICA_TYPE_LABEL;
    use crate::store::MockObjectStorageBackend;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
    use mockall::predicate::*;
    use mockall::Sequence;
    use std::collections::BTreeMap;

    fn key() -> ObjectKey {
        ObjectKey {
            namespace: "team-a".to_string(),
            name: "mnist-worker-0".to_string(),
            uid: "pod-uid".to_string(),
        }
    }

    fn pod(owner_kind: &str, with_label: bool) -> Pod {
        let mut labels = BTreeMap::new();
        if with_label {
            labels.insert(REPLICA_TYPE_LABEL.to_string(), "Worker".to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some("mnist-worker-0".to_string()),
                namespace: Some("team-a".to_string()),
                uid: Some("pod-uid".to_string()),
                resource_version: Some("7".to_string()),
                labels: Some(labels),
                owner_references: Some(vec![OwnerReference {
                    api_version: "kubeflow.org/v1".to_string(),
                    kind: owner_kind.to_string(),
                    name: "mnist".to_string(),
                    uid: "job-uid".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_watches_only_labelled_pods() {
        let handler = PodHandler::new(Arc::new(MockObjectStorageBackend::new()));
        let selectors: Vec<Option<String>> = handler
            .watcher_configs()
            .into_iter()
            .map(|c| c.label_selector)
            .collect();

        assert_eq!(selectors.len(), REPLICA_TYPE_LABELS.len());
        assert_eq!(selectors[0].as_deref(), Some(REPLICA_TYPE_LABEL));
        assert!(selectors.contains(&Some("training.kubeflow.org/replica-type".to_string())));
    }

    #[tokio::test]
    async fn test_gone_pod_is_stopped() {
        let mut store = MockObjectStorageBackend::new();
        store
            .expect_update_pod_record_stopped()
            .with(eq("team-a"), eq("mnist-worker-0"), eq("pod-uid"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        PodHandler::new(Arc::new(store)).sync(&key(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_pod_is_written() {
        let mut store = MockObjectStorageBackend::new();
        store
            .expect_write_pod()
            .withf(|p| p.job_uid == "job-uid" && p.replica_type == "worker")
            .times(1)
            .returning(|_| Ok(()));
        store.expect_update_pod_record_stopped().never();

        PodHandler::new(Arc::new(store))
            .sync(&key(), Some(pod("TFJob", true)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminating_pod_stopped_then_written() {
        let mut seq = Sequence::new();
        let mut store = MockObjectStorageBackend::new();
        store
            .expect_update_pod_record_stopped()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        store
            .expect_write_pod()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut terminating = pod("PyTorchJob", true);
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));

        PodHandler::new(Arc::new(store))
            .sync(&key(), Some(terminating))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unrelated_pods_are_skipped() {
        let mut store = MockObjectStorageBackend::new();
        store.expect_write_pod().never();

        let handler = PodHandler::new(Arc::new(store));
        handler.sync(&key(), Some(pod("ReplicaSet", true))).await.unwrap();
        handler.sync(&key(), Some(pod("TFJob", false))).await.unwrap();
    }
}
