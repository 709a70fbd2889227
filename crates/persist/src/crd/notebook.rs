use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "Notebook",
    namespaced,
    status = "NotebookStatus"
)]
pub struct NotebookSpec {
    #[serde(default)]
    pub template: NotebookTemplateSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct NotebookTemplateSpec {
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotebookStatus {
    #[serde(default)]
    pub conditions: Vec<NotebookCondition>,

    #[serde(default)]
    pub ready_replicas: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotebookCondition {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
