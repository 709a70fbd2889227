use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use tracing::debug;

use crate::crd::CONSOLE_USER_LABEL;
use crate::store::{job_state, EvaluateJobRecord};
use crate::{Error, Result};

/// Label selecting batch Jobs that run model evaluations.
pub const EVALUATE_APP_LABEL: (&str, &str) = ("app", "evaluatejob");

pub fn is_evaluate_job(job: &Job) -> bool {
    job.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(EVALUATE_APP_LABEL.0))
        .map_or(false, |v| v == EVALUATE_APP_LABEL.1)
}

pub fn convert(job: &Job) -> Result<EvaluateJobRecord> {
    let meta = &job.metadata;
    let name = meta.name.clone().unwrap_or_default();
    let namespace = meta.namespace.clone().unwrap_or_default();
    debug!("Converting evaluate job {}/{}", namespace, name);

    let pod = job
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .ok_or_else(|| {
            Error::Conversion(format!("evaluate job {}/{} has no pod spec", namespace, name))
        })?;
    let container = pod
        .containers
        .first()
        .ok_or_else(|| {
            Error::Conversion(format!("evaluate job {}/{} has no containers", namespace, name))
        })?;

    let env: BTreeMap<String, String> = container
        .env
        .iter()
        .flatten()
        .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
        .collect();
    let var = |key: &str| env.get(key).cloned().unwrap_or_default();

    let code = match pod.init_containers.as_ref().and_then(|c| c.first()) {
        Some(init) => {
            let code: BTreeMap<String, String> = init
                .env
                .iter()
                .flatten()
                .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
                .collect();
            serde_json::to_string(&code)?
        }
        None => String::new(),
    };

    let status = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.last())
        .map(|c| c.type_.clone())
        .unwrap_or_else(|| job_state::CREATED.to_string());

    Ok(EvaluateJobRecord {
        job_id: var("JOB_ID"),
        name,
        namespace,
        uid: meta.uid.clone().unwrap_or_default(),
        user_id: meta
            .labels
            .as_ref()
            .and_then(|l| l.get(CONSOLE_USER_LABEL))
            .cloned(),
        model_name: var("MODEL_NAME"),
        model_version: var("MODEL_VERSION"),
        status,
        image: container.image.clone().unwrap_or_default(),
        dataset_path: var("DATASET_DIR"),
        code,
        command: container.command.clone().unwrap_or_default().join(" "),
        report_path: var("METRICS_DIR"),
        is_deleted: 0,
        gmt_created: meta.creation_timestamp.as_ref().map(|t| t.0),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    fn evaluate_job(conditions: &[&str]) -> Job {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "evaluatejob".to_string());
        Job {
            metadata: ObjectMeta {
                name: Some("eval-resnet".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("eval-uid".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        init_containers: Some(vec![Container {
                            name: "git-sync".to_string(),
                            env: Some(vec![env("GIT_SYNC_REPO", "https://example.com/repo.git")]),
                            ..Default::default()
                        }]),
                        containers: vec![Container {
                            name: "evaluate".to_string(),
                            image: Some("eval:1".to_string()),
                            command: Some(vec!["python".to_string(), "eval.py".to_string()]),
                            env: Some(vec![
                                env("MODEL_NAME", "resnet"),
                                env("MODEL_VERSION", "v2"),
                                env("JOB_ID", "job-7"),
                                env("DATASET_DIR", "/data/imagenet"),
                                env("METRICS_DIR", "/reports"),
                            ]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(JobStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|t| JobCondition {
                            type_: t.to_string(),
                            status: "True".to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_convert() {
        let job = evaluate_job(&["Complete"]);
        assert!(is_evaluate_job(&job));

        let record = convert(&job).unwrap();
        assert_eq!(record.model_name, "resnet");
        assert_eq!(record.model_version, "v2");
        assert_eq!(record.job_id, "job-7");
        assert_eq!(record.dataset_path, "/data/imagenet");
        assert_eq!(record.report_path, "/reports");
        assert_eq!(record.command, "python eval.py");
        assert_eq!(record.code, r#"{"GIT_SYNC_REPO":"https://example.com/repo.git"}"#);
        assert_eq!(record.status, "Complete");
    }

    #[test]
    fn test_status_defaults_to_created() {
        let record = convert(&evaluate_job(&[])).unwrap();
        assert_eq!(record.status, job_state::CREATED);
    }
}
