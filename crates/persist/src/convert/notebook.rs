use serde::Serialize;
use tracing::debug;

use super::resources::{ResourceList, RESOURCE_NVIDIA_GPU};
use crate::crd::{Notebook, CONSOLE_USER_LABEL};
use crate::store::{NotebookRecord, NotebookStatus};
use crate::{Error, Result};

pub const USER_NAME_LABEL: &str = "userName";
pub const TOKEN_LABEL: &str = "Token";

#[derive(Debug, Serialize)]
struct MountedVolume<'a> {
    name: &'a str,
    path: &'a str,
}

pub fn status_of(notebook: &Notebook) -> NotebookStatus {
    let conditions = notebook
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    match conditions.first().map(|c| c.type_.as_str()) {
        None => NotebookStatus::Starting,
        Some("Running") => NotebookStatus::Running,
        Some("Waiting") => NotebookStatus::Starting,
        Some(_) => NotebookStatus::Stopped,
    }
}

pub fn convert(notebook: &Notebook) -> Result<NotebookRecord> {
    let meta = &notebook.metadata;
    let name = meta.name.clone().unwrap_or_default();
    let namespace = meta.namespace.clone().unwrap_or_default();
    debug!("Converting notebook {}/{}", namespace, name);

    let pod = &notebook.spec.template.spec;
    let container = pod
        .containers
        .first()
        .ok_or_else(|| {
            Error::Conversion(format!("notebook {}/{} has no containers", namespace, name))
        })?;

    let volumes: Vec<MountedVolume> = container
        .volume_mounts
        .iter()
        .flatten()
        .map(|m| MountedVolume {
            name: &m.name,
            path: &m.mount_path,
        })
        .collect();

    let resources = container.resources.clone().unwrap_or_default();
    let requests = resources.requests.unwrap_or_default();
    let limits = resources.limits.unwrap_or_default();
    let quantity = |list: &ResourceList, key: &str| {
        list.get(key).map(|q| q.0.clone()).unwrap_or_else(|| "0".to_string())
    };

    let pull_secrets = match &pod.image_pull_secrets {
        Some(secrets) => serde_json::to_string(secrets)?,
        None => "[]".to_string(),
    };

    let labels = meta.labels.clone().unwrap_or_default();

    Ok(NotebookRecord {
        name,
        namespace,
        image: container.image.clone().unwrap_or_default(),
        volumes: serde_json::to_string(&volumes)?,
        cpu: quantity(&requests, "cpu"),
        memory: quantity(&requests, "memory"),
        gpu: quantity(&limits, RESOURCE_NVIDIA_GPU),
        user_name: labels.get(USER_NAME_LABEL).cloned().unwrap_or_default(),
        user_id: labels.get(CONSOLE_USER_LABEL).cloned(),
        token: labels.get(TOKEN_LABEL).cloned().unwrap_or_default(),
        status: status_of(notebook),
        image_pull_secrets: pull_secrets,
        gmt_created: meta.creation_timestamp.as_ref().map(|t| t.0),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::notebook::{
        NotebookCondition, NotebookSpec, NotebookStatus as CrdStatus, NotebookTemplateSpec,
    };
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements, VolumeMount};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn notebook(conditions: &[&str]) -> Notebook {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("2".to_string()));
        let mut limits = BTreeMap::new();
        limits.insert(RESOURCE_NVIDIA_GPU.to_string(), Quantity("1".to_string()));

        let mut nb = Notebook::new(
            "lab",
            NotebookSpec {
                template: NotebookTemplateSpec {
                    spec: PodSpec {
                        containers: vec![Container {
                            name: "lab".to_string(),
                            image: Some("jupyter:latest".to_string()),
                            resources: Some(ResourceRequirements {
                                requests: Some(requests),
                                limits: Some(limits),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "workspace".to_string(),
                                mount_path: "/home/jovyan".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                },
            },
        );
        nb.status = Some(CrdStatus {
            conditions: conditions
                .iter()
                .map(|t| NotebookCondition {
                    type_: t.to_string(),
                    ..Default::default()
                })
                .collect(),
            ready_replicas: 0,
        });
        nb
    }

    #[test]
    fn test_status() {
        let cases = vec![
            (vec![], NotebookStatus::Starting),
            (vec!["Running"], NotebookStatus::Running),
            (vec!["Waiting", "Running"], NotebookStatus::Starting),
            (vec!["Terminated"], NotebookStatus::Stopped),
        ];

        for (conditions, expected) in cases {
            assert_eq!(status_of(&notebook(&conditions)), expected, "{:?}", conditions);
        }
    }

    #[test]
    fn test_convert() {
        let record = convert(&notebook(&["Running"])).unwrap();
        assert_eq!(record.cpu, "2");
        assert_eq!(record.memory, "0");
        assert_eq!(record.gpu, "1");
        assert_eq!(record.volumes, r#"[{"name":"workspace","path":"/home/jovyan"}]"#);
        assert_eq!(record.image_pull_secrets, "[]");
    }

    #[test]
    fn test_notebook_without_containers() {
        let mut nb = notebook(&[]);
        nb.spec.template.spec.containers.clear();
        assert!(matches!(convert(&nb), Err(Error::Conversion(_))));
    }
}
