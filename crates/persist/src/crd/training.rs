use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::discovery::ApiResource;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{CleanPodPolicy, FlatRunPolicy, JobStatus, ReplicaSpecs, RunPolicy};

pub const TF_JOB_KIND: &str = "TFJob";
pub const PYTORCH_JOB_KIND: &str = "PyTorchJob";
pub const XDL_JOB_KIND: &str = "XDLJob";
pub const XGBOOST_JOB_KIND: &str = "XGBoostJob";
pub const MPI_JOB_KIND: &str = "MPIJob";

pub const MPI_REPLICA_TYPE_LAUNCHER: &str = "Launcher";
pub const MPI_REPLICA_TYPE_WORKER: &str = "Worker";

/// Name of the main container in pods of the given job kind.
pub fn default_container_name(kind: &str) -> &'static str {
    match kind {
        TF_JOB_KIND => "tensorflow",
        PYTORCH_JOB_KIND => "pytorch",
        XDL_JOB_KIND => "xdl",
        XGBOOST_JOB_KIND => "xgboostjob",
        MPI_JOB_KIND => "mpi",
        _ => "",
    }
}

/// API coordinates of a training job kind.
pub fn api_resource(kind: &str) -> Option<ApiResource> {
    match kind {
        TF_JOB_KIND => Some(ApiResource::erase::<TFJob>(&())),
        PYTORCH_JOB_KIND => Some(ApiResource::erase::<PyTorchJob>(&())),
        XDL_JOB_KIND => Some(ApiResource::erase::<XDLJob>(&())),
        XGBOOST_JOB_KIND => Some(ApiResource::erase::<XGBoostJob>(&())),
        MPI_JOB_KIND => Some(ApiResource::erase::<MPIJob>(&())),
        _ => None,
    }
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "TFJob",
    namespaced,
    status = "JobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TFJobSpec {
    #[serde(rename = "tfReplicaSpecs", default)]
    pub tf_replica_specs: ReplicaSpecs,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<RunPolicy>,

    #[serde(flatten)]
    pub legacy_run_policy: FlatRunPolicy,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "PyTorchJob",
    namespaced,
    status = "JobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PyTorchJobSpec {
    #[serde(rename = "pytorchReplicaSpecs", default)]
    pub pytorch_replica_specs: ReplicaSpecs,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<RunPolicy>,

    #[serde(flatten)]
    pub legacy_run_policy: FlatRunPolicy,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "xdl.kubedl.io",
    version = "v1alpha1",
    kind = "XDLJob",
    namespaced,
    status = "JobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct XDLJobSpec {
    #[serde(rename = "xdlReplicaSpecs", default)]
    pub xdl_replica_specs: ReplicaSpecs,

    #[serde(flatten)]
    pub run_policy: RunPolicy,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_finish_work_num: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_finish_work_rate: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct XGBoostJobStatus {
    #[serde(flatten)]
    pub job_status: JobStatus,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "xgboostjob.kubeflow.org",
    version = "v1alpha1",
    kind = "XGBoostJob",
    namespaced,
    status = "XGBoostJobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct XGBoostJobSpec {
    #[serde(rename = "xgbReplicaSpecs", default)]
    pub xgb_replica_specs: ReplicaSpecs,

    #[serde(flatten)]
    pub run_policy: RunPolicy,
}

/// MPIJob as served by the v1alpha1 API. Objects written by older clients
/// only carry the flat legacy fields; newer ones carry `mpiReplicaSpecs`.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[kube(
    group = "kubeflow.org",
    version = "v1alpha1",
    kind = "MPIJob",
    namespaced,
    status = "JobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MPIJobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpi_replica_specs: Option<ReplicaSpecs>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub slots_per_worker: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<RunPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    #[serde(flatten)]
    pub legacy: MPILegacySpec,
}

/// Deprecated flat MPIJob fields.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MPILegacySpec {
    /// Total number of GPUs for the whole job.
    #[serde(rename = "gpus", skip_serializing_if = "Option::is_none")]
    pub deprecated_gpus: Option<i32>,

    #[serde(rename = "gpusPerNode", skip_serializing_if = "Option::is_none")]
    pub gpus_per_node: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_units: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_units_per_node: Option<i32>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub processing_resource_type: String,

    #[serde(default)]
    pub launcher_on_master: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

impl MPILegacySpec {
    pub fn is_set(&self) -> bool {
        self.deprecated_gpus.is_some()
            || self.processing_units.is_some()
            || self.replicas.is_some()
            || self.template.is_some()
    }
}
