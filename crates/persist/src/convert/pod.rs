use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::debug;

use super::resources::{gpu_count, sum_containers};
use crate::crd::training::default_container_name;
use crate::crd::REPLICA_TYPE_LABEL;
use crate::store::{PodRecord, PodStatus};
use crate::{Error, Result};

/// Replica type labels, checked in order.
pub const REPLICA_TYPE_LABELS: &[&str] = &[
    REPLICA_TYPE_LABEL,
    "training.kubeflow.org/replica-type",
    "tf-replica-type",
    "pytorch-replica-type",
];

/// The owner reference marked as controller.
pub fn controller_owner(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))
}

pub fn replica_type(pod: &Pod) -> Option<String> {
    let labels = pod.metadata.labels.as_ref()?;
    REPLICA_TYPE_LABELS
        .iter()
        .find_map(|key| labels.get(*key))
        .map(|v| v.to_lowercase())
}

fn pick_status<'a>(
    statuses: &'a [ContainerStatus],
    default_name: &str,
) -> Option<&'a ContainerStatus> {
    statuses
        .iter()
        .find(|s| !default_name.is_empty() && s.name == default_name)
        .or_else(|| statuses.first())
}

/// Converts a replica pod. `now` stands in for a missing finish time of a
/// pod that already reached a final phase.
pub fn convert(pod: &Pod, now: DateTime<Utc>) -> Result<PodRecord> {
    let meta = &pod.metadata;
    let name = meta.name.clone().unwrap_or_default();
    let namespace = meta.namespace.clone().unwrap_or_default();
    debug!("Converting pod {}/{}", namespace, name);

    let owner = controller_owner(pod)
        .ok_or_else(|| {
            Error::Conversion(format!("pod {}/{} has no controller owner", namespace, name))
        })?;
    let rtype = replica_type(pod).ok_or_else(|| {
        Error::Conversion(format!(
            "pod {}/{} has no replica type label [{}]",
            namespace, name, REPLICA_TYPE_LABEL
        ))
    })?;

    let mut record = PodRecord {
        name,
        namespace,
        uid: meta.uid.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        job_uid: owner.uid.clone(),
        job_name: owner.name.clone(),
        replica_type: rtype,
        gmt_created: meta.creation_timestamp.as_ref().map(|t| t.0),
        status: PodStatus::Unknown,
        ..Default::default()
    };

    let default_name = default_container_name(&owner.kind);
    let status = pod.status.clone().unwrap_or_default();
    record.pod_ip = status.pod_ip.clone().filter(|ip| !ip.is_empty());
    record.host_ip = status.host_ip.clone().filter(|ip| !ip.is_empty());

    let Some(spec) = pod.spec.as_ref() else {
        return Ok(record);
    };
    if spec.containers.is_empty() {
        return Ok(record);
    }

    record.image = spec
        .containers
        .iter()
        .find(|c| c.name == default_name)
        .or_else(|| spec.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    let (limits, _) = sum_containers(&spec.containers);
    record.gpu = gpu_count(&limits) as i32;

    record.status = status
        .phase
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or(PodStatus::Unknown);

    let mut dump = pod.clone();
    dump.status = None;
    record.pod_json = serde_json::to_string(&dump)?;

    let statuses = status.container_statuses.unwrap_or_default();
    let Some(container) = pick_status(&statuses, default_name) else {
        return Ok(record);
    };
    let state = container.state.clone().unwrap_or_default();

    match record.status {
        PodStatus::Running => {
            record.gmt_pod_running = state.running.and_then(|r| r.started_at).map(|t| t.0);
        }
        PodStatus::Succeeded | PodStatus::Failed => {
            if let Some(running) = state.running {
                record.gmt_pod_running = running.started_at.map(|t| t.0);
            }
            if let Some(terminated) = state.terminated {
                record.gmt_pod_finished = terminated.finished_at.as_ref().map(|t| t.0);
                if record.status == PodStatus::Failed {
                    record.extended = Some(format!(
                        "Reason: {}\nExitCode: {}\nMessage: {}",
                        terminated.reason.unwrap_or_default(),
                        terminated.exit_code,
                        terminated.message.unwrap_or_default()
                    ));
                }
            }
            if record.gmt_pod_finished.is_none() {
                record.gmt_pod_finished = Some(now);
            }
        }
        _ => {}
    }

    Ok(record)
}
