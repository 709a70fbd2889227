use k8s_openapi::api::core::v1::{ObjectReference, TypedLocalObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "apps.kubedl.io",
    version = "v1alpha1",
    kind = "Cron",
    namespaced,
    status = "CronStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CronSpec {
    /// Schedule in cron format
    pub schedule: String,

    /// Template of the workload launched on every tick
    #[serde(rename = "template")]
    pub cron_template: CronTemplateSpec,

    /// One of Allow, Forbid or Replace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_policy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Time>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronStatus {
    #[serde(default)]
    pub active: Vec<ObjectReference>,

    #[serde(default)]
    pub history: Vec<CronHistory>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<Time>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct CronHistory {
    #[serde(default)]
    pub uid: String,

    pub object: TypedLocalObjectReference,

    /// Final job condition type
    #[serde(default)]
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<Time>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<Time>,
}
