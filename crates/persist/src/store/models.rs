use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Job status values. Cluster conditions are stored verbatim, `Stopping` and
/// `Stopped` only exist in the store.
pub mod job_state {
    pub const CREATED: &str = "Created";
    pub const RUNNING: &str = "Running";
    pub const RESTARTING: &str = "Restarting";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const STOPPING: &str = "Stopping";
    pub const STOPPED: &str = "Stopped";

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, SUCCEEDED | FAILED | STOPPED)
    }
}

pub mod cron_state {
    pub const RUNNING: &str = "Running";
    pub const SUSPEND: &str = "Suspend";
}

/// Training job projection, one row per (namespace, name, uid, kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobRecord {
    pub id: Option<i64>,
    pub name: String,
    pub namespace: String,
    pub display_name: String,
    pub uid: String,
    pub kind: String,
    pub status: String,
    pub resource_version: String,
    pub job_json: String,

    pub region_id: Option<String>,
    pub cluster_id: Option<String>,
    pub tenant_id: Option<String>,
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub created_by: Option<String>,
    pub reason_code: Option<String>,
    pub reason: Option<String>,
    pub extended: Option<String>,

    pub is_in_k8s: bool,
    pub is_deleted: Option<i32>,

    pub resources: String,
    pub job_config: String,

    pub gmt_created: Option<DateTime<Utc>>,
    pub gmt_modified: Option<DateTime<Utc>>,
    pub gmt_job_submitted: Option<DateTime<Utc>>,
    pub gmt_job_running: Option<DateTime<Utc>>,
    pub gmt_job_stopped: Option<DateTime<Utc>>,
    pub gmt_job_finished: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PodStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
    /// Set by the store when the pod disappeared before reaching a final phase.
    Stopped,
}

impl PodStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodStatus::Succeeded | PodStatus::Failed | PodStatus::Stopped)
    }
}

impl std::str::FromStr for PodStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(PodStatus::Pending),
            "Running" => Ok(PodStatus::Running),
            "Succeeded" => Ok(PodStatus::Succeeded),
            "Failed" => Ok(PodStatus::Failed),
            "Unknown" => Ok(PodStatus::Unknown),
            "Stopped" => Ok(PodStatus::Stopped),
            _ => Err(Error::Config(format!("Invalid pod status: {}", s))),
        }
    }
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodStatus::Pending => write!(f, "Pending"),
            PodStatus::Running => write!(f, "Running"),
            PodStatus::Succeeded => write!(f, "Succeeded"),
            PodStatus::Failed => write!(f, "Failed"),
            PodStatus::Unknown => write!(f, "Unknown"),
            PodStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Replica pod projection, linked to its job through `job_uid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PodRecord {
    pub id: Option<i64>,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub status: PodStatus,
    pub image: String,
    pub gpu: i32,
    pub job_uid: String,
    pub job_name: String,
    pub replica_type: String,
    pub pod_json: String,
    pub host_ip: Option<String>,
    pub pod_ip: Option<String>,
    pub extended: Option<String>,

    pub gmt_created: Option<DateTime<Utc>>,
    pub gmt_modified: Option<DateTime<Utc>>,
    pub gmt_pod_running: Option<DateTime<Utc>>,
    pub gmt_pod_finished: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CronRecord {
    pub id: Option<i64>,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub kind: String,
    pub status: String,
    pub region_id: Option<String>,
    pub cluster_id: Option<String>,
    pub schedule: String,
    pub concurrency_policy: String,
    /// JSON list of `{name, namespace, uid}`
    pub active: String,
    /// JSON list of finished runs, see [`crate::crd::CronHistory`]
    pub history: String,
    pub history_limit: Option<i32>,
    pub is_in_k8s: bool,
    pub is_deleted: Option<i32>,
    pub suspend: Option<i8>,
    pub deadline: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub last_schedule_time: Option<DateTime<Utc>>,
    pub gmt_created: Option<DateTime<Utc>>,
    pub gmt_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NotebookStatus {
    #[default]
    Starting,
    Running,
    Stopped,
    Deleted,
}

impl std::str::FromStr for NotebookStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Starting" => Ok(NotebookStatus::Starting),
            "Running" => Ok(NotebookStatus::Running),
            "Stopped" => Ok(NotebookStatus::Stopped),
            "Deleted" => Ok(NotebookStatus::Deleted),
            _ => Err(Error::Config(format!("Invalid notebook status: {}", s))),
        }
    }
}

impl std::fmt::Display for NotebookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotebookStatus::Starting => write!(f, "Starting"),
            NotebookStatus::Running => write!(f, "Running"),
            NotebookStatus::Stopped => write!(f, "Stopped"),
            NotebookStatus::Deleted => write!(f, "Deleted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NotebookRecord {
    pub id: Option<i64>,
    pub name: String,
    pub namespace: String,
    pub image: String,
    /// JSON list of `{name, path}`
    pub volumes: String,
    pub cpu: String,
    pub gpu: String,
    pub memory: String,
    pub user_name: String,
    pub user_id: Option<String>,
    pub token: String,
    pub status: NotebookStatus,
    pub image_pull_secrets: String,
    pub gmt_created: Option<DateTime<Utc>>,
    pub gmt_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvaluateJobRecord {
    pub id: Option<i64>,
    pub job_id: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub user_id: Option<String>,
    pub model_name: String,
    pub model_version: String,
    pub status: String,
    pub image: String,
    pub dataset_path: String,
    pub code: String,
    pub command: String,
    pub metrics: String,
    pub is_deleted: i32,
    pub report_path: String,
    pub gmt_created: Option<DateTime<Utc>>,
    pub gmt_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelRecord {
    pub id: Option<i64>,
    pub model_name: String,
    pub model_version: String,
    pub oss_path: String,
    pub job_id: String,
    pub user_id: Option<String>,
    pub gmt_created: Option<DateTime<Utc>>,
    pub gmt_modified: Option<DateTime<Utc>>,
}
