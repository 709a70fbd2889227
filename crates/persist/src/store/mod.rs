mod config;
mod factory;
mod models;
mod query;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use models::*;
pub use query::*;
pub use sqlite::{SqliteBackend, NAME as SQLITE};

use std::sync::Arc;

use async_trait::async_trait;

/// Durable projection of cluster workloads.
///
/// Lookups return `Ok(None)` when no row matches. Empty `uid` and `region`
/// arguments are not used as filters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorageBackend: Send + Sync {
    async fn initialize(&self) -> crate::Result<()>;
    async fn close(&self) -> crate::Result<()>;
    fn name(&self) -> &'static str;

    /// Copy of this backend whose listings are scoped to `user`.
    fn with_user(&self, user: &str) -> Arc<dyn ObjectStorageBackend>;

    // Job operations
    async fn write_job(&self, job: JobRecord) -> crate::Result<()>;
    async fn read_job(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        kind: &str,
        region: &str,
    ) -> crate::Result<Option<JobRecord>>;
    async fn list_jobs(&self, query: &JobQuery) -> crate::Result<Page<JobRecord>>;
    async fn update_job_record_stopped(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        kind: &str,
        region: &str,
    ) -> crate::Result<()>;
    async fn remove_job_record(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        kind: &str,
        region: &str,
    ) -> crate::Result<()>;

    // Pod operations
    async fn write_pod(&self, pod: PodRecord) -> crate::Result<()>;
    async fn read_pod(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> crate::Result<Option<PodRecord>>;
    async fn list_pods(
        &self,
        namespace: &str,
        name: &str,
        job_uid: &str,
        region: &str,
    ) -> crate::Result<Vec<PodRecord>>;
    async fn update_pod_record_stopped(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> crate::Result<()>;

    // Cron operations
    async fn write_cron(&self, cron: CronRecord) -> crate::Result<()>;
    async fn get_cron(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> crate::Result<Option<CronRecord>>;
    async fn list_crons(&self, query: &CronQuery) -> crate::Result<Page<CronRecord>>;
    async fn delete_cron(&self, namespace: &str, name: &str, uid: &str) -> crate::Result<()>;
    async fn list_cron_histories(
        &self,
        namespace: &str,
        name: &str,
        job_name: &str,
        job_status: &str,
        cron_id: &str,
    ) -> crate::Result<Vec<JobRecord>>;

    // Notebook operations
    async fn write_notebook(&self, notebook: NotebookRecord) -> crate::Result<()>;
    async fn get_notebook(
        &self,
        namespace: &str,
        name: &str,
    ) -> crate::Result<Option<NotebookRecord>>;
    async fn list_notebooks(&self, query: &NotebookQuery) -> crate::Result<Vec<NotebookRecord>>;
    async fn delete_notebook(&self, namespace: &str, name: &str) -> crate::Result<()>;
    async fn update_notebook_token(
        &self,
        namespace: &str,
        name: &str,
        token: &str,
    ) -> crate::Result<()>;

    // Evaluate job operations
    async fn write_evaluate_job(&self, job: EvaluateJobRecord) -> crate::Result<()>;
    async fn get_evaluate_job(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> crate::Result<Option<EvaluateJobRecord>>;
    async fn list_evaluate_jobs(
        &self,
        query: &EvaluateJobQuery,
    ) -> crate::Result<Page<EvaluateJobRecord>>;
    async fn delete_evaluate_job(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> crate::Result<()>;

    // Model catalogue
    async fn write_model(&self, model: ModelRecord) -> crate::Result<i64>;
    async fn get_model(&self, id: i64) -> crate::Result<Option<ModelRecord>>;
    async fn list_models(&self, query: &ModelQuery) -> crate::Result<Page<ModelRecord>>;
    async fn delete_model(&self, id: i64) -> crate::Result<()>;
}
