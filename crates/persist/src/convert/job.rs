use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::resources::{aggregate_job_resources, pod_resources, replicas_of, ResourceList};
use crate::crd::{
    JobStatus, ReplicaSpecs, RunPolicy, ANNOTATION_GIT_SYNC_CONFIG, ANNOTATION_TENANCY_INFO,
    ANNOTATION_TENSORBOARD_CONFIG, CONSOLE_USER_LABEL, CREATED_BY_LABEL,
};
use crate::store::{job_state, JobRecord};
use crate::Result;

pub const REMARK_ENABLE_TENSORBOARD: &str = "EnableTensorBoard";

/// Kind-independent view of a training job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub kind: String,
    pub metadata: ObjectMeta,
    pub replica_specs: ReplicaSpecs,
    pub run_policy: RunPolicy,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplicaResources {
    pub resources: ResourceRequirements,
    pub replicas: i32,
}

/// Per replica type resources, plus the requests of the whole job under
/// `total`. Replica type keys are capitalized, so they never collide with it.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct JobResources {
    #[serde(flatten)]
    pub replicas: BTreeMap<String, ReplicaResources>,
    #[serde(default)]
    pub total: ResourceList,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub code_bindings: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_bindings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TenancyInfo {
    #[serde(default)]
    user: String,
}

fn user_from_annotations(annotations: &BTreeMap<String, String>) -> Option<String> {
    let raw = annotations.get(ANNOTATION_TENANCY_INFO)?;
    match serde_json::from_str::<TenancyInfo>(raw) {
        Ok(info) if !info.user.is_empty() => Some(info.user),
        Ok(_) => None,
        Err(e) => {
            debug!("Ignoring malformed tenancy annotation: {}", e);
            None
        }
    }
}

pub fn convert(view: &JobView, region: &str) -> Result<JobRecord> {
    let meta = &view.metadata;
    let labels = meta.labels.clone().unwrap_or_default();
    let annotations = meta.annotations.clone().unwrap_or_default();
    let created = meta.creation_timestamp.as_ref().map(|t| t.0);

    debug!(
        "Converting {} {}/{}",
        view.kind,
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    );

    let mut record = JobRecord {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        kind: view.kind.clone(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        created_by: labels.get(CREATED_BY_LABEL).cloned(),
        user_id: labels
            .get(CONSOLE_USER_LABEL)
            .cloned()
            .or_else(|| user_from_annotations(&annotations)),
        region_id: (!region.is_empty()).then(|| region.to_string()),
        is_in_k8s: true,
        is_deleted: Some(0),
        gmt_created: created,
        gmt_job_submitted: created,
        ..Default::default()
    };

    record.status = view
        .status
        .last_condition()
        .map(|c| c.type_.clone())
        .unwrap_or_else(|| job_state::CREATED.to_string());
    if let Some(last) = view.status.last_condition() {
        record.reason_code = Some(last.reason.clone().unwrap_or_default());
        record.reason = Some(last.message.clone().unwrap_or_default());
    }
    record.gmt_job_running = view
        .status
        .condition(job_state::RUNNING)
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0);
    record.gmt_job_finished = view.status.completion_time.as_ref().map(|t| t.0);

    if annotations
        .get(ANNOTATION_TENSORBOARD_CONFIG)
        .map_or(false, |v| !v.is_empty())
    {
        record.extended = Some(REMARK_ENABLE_TENSORBOARD.to_string());
    }

    record.job_json = serde_json::to_string(view)?;
    record.resources = serde_json::to_string(&compute_job_resources(&view.replica_specs))?;
    let config = compute_job_config(&annotations, &view.replica_specs);
    record.job_config = serde_json::to_string(&config)?;

    Ok(record)
}

pub fn compute_job_resources(specs: &ReplicaSpecs) -> JobResources {
    let replicas = specs
        .iter()
        .map(|(rtype, spec)| {
            let resources = spec
                .template
                .spec
                .as_ref()
                .map(pod_resources)
                .unwrap_or_default();
            (
                rtype.clone(),
                ReplicaResources {
                    resources,
                    replicas: replicas_of(spec.replicas),
                },
            )
        })
        .collect();

    JobResources {
        replicas,
        total: aggregate_job_resources(specs),
    }
}

/// Data bindings and commands come from the first replica spec that has
/// them. Replica specs are visited in map order, which is unspecified.
pub fn compute_job_config(
    annotations: &BTreeMap<String, String>,
    specs: &ReplicaSpecs,
) -> JobConfig {
    let mut config = JobConfig::default();

    if let Some(raw) = annotations.get(ANNOTATION_GIT_SYNC_CONFIG).filter(|v| !v.is_empty()) {
        match serde_json::from_str::<HashMap<String, String>>(raw) {
            Ok(bindings) => config.code_bindings = bindings,
            Err(e) => {
                error!("Invalid git sync config {}: {}", raw, e);
                return config;
            }
        }
    }

    let mut found_data = false;
    let mut found_command = false;
    for spec in specs.values() {
        let Some(pod) = spec.template.spec.as_ref() else {
            continue;
        };

        if !found_data {
            let volumes: Vec<String> = pod
                .volumes
                .iter()
                .flatten()
                .map(|v| v.name.clone())
                .collect();
            if !volumes.is_empty() {
                config.data_bindings = volumes;
                found_data = true;
            }
        }

        if !found_command {
            if let Some(container) = pod.containers.first() {
                config.commands = container.command.clone().unwrap_or_default();
                found_command = true;
            }
        }

        if found_data && found_command {
            break;
        }
    }

    config
}
