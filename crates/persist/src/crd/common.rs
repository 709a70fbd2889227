use std::collections::HashMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carried by every pod created for a training job replica.
pub const REPLICA_TYPE_LABEL: &str = "replica-type";
/// Label naming the console user who submitted the workload.
pub const CONSOLE_USER_LABEL: &str = "arena.kubeflow.org/console-user";
pub const CREATED_BY_LABEL: &str = "createdBy";
pub const ANNOTATION_GIT_SYNC_CONFIG: &str = "kubedl.io/git-sync-config";
pub const ANNOTATION_TENANCY_INFO: &str = "kubedl.io/tenancy";
pub const ANNOTATION_TENSORBOARD_CONFIG: &str = "kubedl.io/tensorboard-config";

/// Replica spec shared by all training job kinds.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub template: PodTemplateSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

/// Replica specs keyed by replica type. Iteration order is unspecified.
pub type ReplicaSpecs = HashMap<String, ReplicaSpec>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum CleanPodPolicy {
    All,
    Running,
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default)]
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Ordered condition history, the last entry is the current state.
    #[serde(default)]
    pub conditions: Vec<JobCondition>,

    #[serde(default)]
    pub replica_statuses: HashMap<String, ReplicaStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<Time>,
}

impl JobStatus {
    pub fn condition(&self, type_: &str) -> Option<&JobCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn last_condition(&self) -> Option<&JobCondition> {
        self.conditions.last()
    }
}

/// Run policy fields that older job kinds carry directly on the spec.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlatRunPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
}
