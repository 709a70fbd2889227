use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::dispatcher::{Handler, ObjectKey};
use crate::convert::{self, JobView};
use crate::crd::training::{
    MPI_JOB_KIND, PYTORCH_JOB_KIND, TF_JOB_KIND, XDL_JOB_KIND, XGBOOST_JOB_KIND,
};
use crate::crd::{MPIJob, PyTorchJob, TFJob, XDLJob, XGBoostJob};
use crate::migration::{canonicalize_replica_types, migrate_mpi_legacy, run_policy_from};
use crate::store::{job_state, ObjectStorageBackend};
use crate::Result;

/// Normalizes one job kind into a [`JobView`].
pub trait JobAdapter: Send + Sync + 'static {
    type Job: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    const KIND: &'static str;

    fn to_view(job: &Self::Job) -> Result<JobView>;
}

pub struct TFJobAdapter;
pub struct PyTorchJobAdapter;
pub struct XDLJobAdapter;
pub struct XGBoostJobAdapter;
pub struct MPIJobAdapter;

impl JobAdapter for TFJobAdapter {
    type Job = TFJob;
    const KIND: &'static str = TF_JOB_KIND;

    fn to_view(job: &TFJob) -> Result<JobView> {
        Ok(JobView {
            kind: Self::KIND.to_string(),
            metadata: job.metadata.clone(),
            replica_specs: canonicalize_replica_types(job.spec.tf_replica_specs.clone()),
            run_policy: run_policy_from(job.spec.run_policy.as_ref(), &job.spec.legacy_run_policy),
            status: job.status.clone().unwrap_or_default(),
        })
    }
}

impl JobAdapter for PyTorchJobAdapter {
    type Job = PyTorchJob;
    const KIND: &'static str = PYTORCH_JOB_KIND;

    fn to_view(job: &PyTorchJob) -> Result<JobView> {
        Ok(JobView {
            kind: Self::KIND.to_string(),
            metadata: job.metadata.clone(),
            replica_specs: canonicalize_replica_types(job.spec.pytorch_replica_specs.clone()),
            run_policy: run_policy_from(job.spec.run_policy.as_ref(), &job.spec.legacy_run_policy),
            status: job.status.clone().unwrap_or_default(),
        })
    }
}

impl JobAdapter for XDLJobAdapter {
    type Job = XDLJob;
    const KIND: &'static str = XDL_JOB_KIND;

    fn to_view(job: &XDLJob) -> Result<JobView> {
        Ok(JobView {
            kind: Self::KIND.to_string(),
            metadata: job.metadata.clone(),
            replica_specs: job.spec.xdl_replica_specs.clone(),
            run_policy: job.spec.run_policy.clone(),
            status: job.status.clone().unwrap_or_default(),
        })
    }
}

impl JobAdapter for XGBoostJobAdapter {
    type Job = XGBoostJob;
    const KIND: &'static str = XGBOOST_JOB_KIND;

    fn to_view(job: &XGBoostJob) -> Result<JobView> {
        Ok(JobView {
            kind: Self::KIND.to_string(),
            metadata: job.metadata.clone(),
            replica_specs: job.spec.xgb_replica_specs.clone(),
            run_policy: job.spec.run_policy.clone(),
            status: job.status.clone().map(|s| s.job_status).unwrap_or_default(),
        })
    }
}

impl JobAdapter for MPIJobAdapter {
    type Job = MPIJob;
    const KIND: &'static str = MPI_JOB_KIND;

    fn to_view(job: &MPIJob) -> Result<JobView> {
        let mut spec = job.spec.clone();
        migrate_mpi_legacy(&mut spec)?;
        Ok(JobView {
            kind: Self::KIND.to_string(),
            metadata: job.metadata.clone(),
            replica_specs: spec.mpi_replica_specs.unwrap_or_default(),
            run_policy: spec.run_policy.unwrap_or_default(),
            status: job.status.clone().unwrap_or_default(),
        })
    }
}

/// Job kinds with a registered adapter.
pub const JOB_KINDS: &[&str] = &[
    TF_JOB_KIND,
    PYTORCH_JOB_KIND,
    XDL_JOB_KIND,
    XGBOOST_JOB_KIND,
    MPI_JOB_KIND,
];

fn is_stopping(status: &str) -> bool {
    status == job_state::STOPPING || status == job_state::STOPPED
}

/// Applies the live state of one job, `None` when it is gone.
///
/// A job stopped from the console stays stopped: its record is only moved
/// towards `Stopped`, whatever the cluster reports.
pub async fn sync_job(
    store: &dyn ObjectStorageBackend,
    region: &str,
    kind: &str,
    key: &ObjectKey,
    view: Option<JobView>,
) -> Result<()> {
    let stored = store
        .read_job(&key.namespace, &key.name, &key.uid, kind, region)
        .await?;
    let stopping = stored.as_ref().map_or(false, |r| is_stopping(&r.status));

    match view {
        None => match stored {
            None => {
                debug!("{} {}/{} is gone and was never stored", kind, key.namespace, key.name);
                Ok(())
            }
            Some(_) if stopping => {
                store
                    .update_job_record_stopped(&key.namespace, &key.name, &key.uid, kind, region)
                    .await
            }
            Some(_) => {
                info!("{} {}/{} deleted, removing record", kind, key.namespace, key.name);
                store
                    .remove_job_record(&key.namespace, &key.name, &key.uid, kind, region)
                    .await
            }
        },
        Some(_) if stopping => {
            store
                .update_job_record_stopped(&key.namespace, &key.name, &key.uid, kind, region)
                .await
        }
        Some(view) => store.write_job(convert::job::convert(&view, region)?).await,
    }
}

pub struct JobHandler<A: JobAdapter> {
    store: Arc<dyn ObjectStorageBackend>,
    region: String,
    adapter: PhantomData<A>,
}

impl<A: JobAdapter> JobHandler<A> {
    pub fn new(store: Arc<dyn ObjectStorageBackend>, region: impl Into<String>) -> Self {
        Self {
            store,
            region: region.into(),
            adapter: PhantomData,
        }
    }
}

#[async_trait]
impl<A: JobAdapter> Handler for JobHandler<A> {
    type Object = A::Job;

    fn kind(&self) -> &str {
        A::KIND
    }

    async fn sync(&self, key: &ObjectKey, live: Option<A::Job>) -> Result<()> {
        let view = live.as_ref().map(A::to_view).transpose()?;
        sync_job(self.store.as_ref(), &self.region, A::KIND, key, view).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MPIJobSpec, ReplicaSpecs, TFJobSpec};
    use crate::store::{JobRecord, MockObjectStorageBackend};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::predicate::*;

    fn key() -> ObjectKey {
        ObjectKey {
            namespace: "team-a".to_string(),
            name: "mnist".to_string(),
            uid: "uid-1".to_string(),
        }
    }

    fn stored(status: &str) -> JobRecord {
        JobRecord {
            name: "mnist".to_string(),
            namespace: "team-a".to_string(),
            uid: "uid-1".to_string(),
            kind: TF_JOB_KIND.to_string(),
            status: status.to_string(),
            resource_version: "3".to_string(),
            ..Default::default()
        }
    }

    fn tf_job() -> TFJob {
        let mut job = TFJob::new(
            "mnist",
            TFJobSpec {
                tf_replica_specs: ReplicaSpecs::new(),
                run_policy: None,
                legacy_run_policy: Default::default(),
            },
        );
        job.metadata = ObjectMeta {
            name: Some("mnist".to_string()),
            namespace: Some("team-a".to_string()),
            uid: Some("uid-1".to_string()),
            resource_version: Some("5".to_string()),
            ..Default::default()
        };
        job
    }

    fn expect_read(store: &mut MockObjectStorageBackend, found: Option<JobRecord>) {
        store
            .expect_read_job()
            .with(eq("team-a"), eq("mnist"), eq("uid-1"), eq(TF_JOB_KIND), eq(""))
            .times(1)
            .returning(move |_, _, _, _, _| Ok(found.clone()));
    }

    #[tokio::test]
    async fn test_gone_and_never_stored() {
        let mut store = MockObjectStorageBackend::new();
        expect_read(&mut store, None);
        store.expect_remove_job_record().never();
        store.expect_update_job_record_stopped().never();

        sync_job(&store, "", TF_JOB_KIND, &key(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_gone_removes_record() {
        let mut store = MockObjectStorageBackend::new();
        expect_read(&mut store, Some(stored(job_state::RUNNING)));
        store
            .expect_remove_job_record()
            .with(eq("team-a"), eq("mnist"), eq("uid-1"), eq(TF_JOB_KIND), eq(""))
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        sync_job(&store, "", TF_JOB_KIND, &key(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_gone_while_stopping_marks_stopped() {
        let mut store = MockObjectStorageBackend::new();
        expect_read(&mut store, Some(stored(job_state::STOPPING)));
        store
            .expect_update_job_record_stopped()
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        store.expect_remove_job_record().never();

        sync_job(&store, "", TF_JOB_KIND, &key(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_job_is_written() {
        let mut store = MockObjectStorageBackend::new();
        expect_read(&mut store, Some(stored(job_state::CREATED)));
        store
            .expect_write_job()
            .withf(|job| job.resource_version == "5" && job.status == job_state::CREATED)
            .times(1)
            .returning(|_| Ok(()));

        let handler = JobHandler::<TFJobAdapter>::new(Arc::new(store), "");
        handler.sync(&key(), Some(tf_job())).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_job_stopped_from_console() {
        let mut store = MockObjectStorageBackend::new();
        expect_read(&mut store, Some(stored(job_state::STOPPED)));
        store.expect_write_job().never();
        store
            .expect_update_job_record_stopped()
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let handler = JobHandler::<TFJobAdapter>::new(Arc::new(store), "");
        handler.sync(&key(), Some(tf_job())).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_errors_are_transient() {
        let mut store = MockObjectStorageBackend::new();
        store
            .expect_read_job()
            .returning(|_, _, _, _, _| Err(crate::Error::Internal("connection reset".to_string())));

        let err = sync_job(&store, "", TF_JOB_KIND, &key(), None).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_tf_view_normalizes_replica_types() {
        let mut job = tf_job();
        job.spec.tf_replica_specs.insert("worker".to_string(), Default::default());

        let view = TFJobAdapter::to_view(&job).unwrap();
        assert!(view.replica_specs.contains_key("Worker"));
        assert!(view.run_policy.clean_pod_policy.is_some());
    }

    #[test]
    fn test_mpi_view_migrates_legacy_spec() {
        let mut spec = MPIJobSpec::default();
        spec.legacy.deprecated_gpus = Some(16);
        spec.legacy.gpus_per_node = Some(8);
        spec.legacy.template = Some(Default::default());
        let job = MPIJob::new("allreduce", spec);

        let view = MPIJobAdapter::to_view(&job).unwrap();
        assert_eq!(view.kind, MPI_JOB_KIND);
        assert_eq!(view.replica_specs["Worker"].replicas, Some(2));
        assert_eq!(view.replica_specs["Launcher"].replicas, Some(1));
    }
}
