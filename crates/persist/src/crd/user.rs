use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespace holding the console's User objects.
pub const USER_NAMESPACE: &str = "kube-ai";

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[kube(
    group = "data.kubeai.alibabacloud.com",
    version = "v1",
    kind = "User",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    #[serde(default)]
    pub user_name: String,

    #[serde(default)]
    pub user_id: String,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub k8s_service_account: K8sServiceAccount,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K8sServiceAccount {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub role_bindings: Vec<K8sRoleBinding>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K8sRoleBinding {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub role_name: String,
}
