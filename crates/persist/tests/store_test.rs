use chrono::{TimeZone, Utc};
use devconsole_persist::{
    store::{
        create_store, job_state, CronQuery, CronRecord, DatabaseConfig, EvaluateJobQuery,
        EvaluateJobRecord, JobQuery, JobRecord, ModelQuery, ModelRecord, NotebookQuery,
        NotebookRecord, NotebookStatus, ObjectStorageBackend, Pagination, PodRecord, PodStatus,
    },
    Error, Result,
};
use serde_json::json;
use std::sync::Arc;

async fn store() -> Arc<dyn ObjectStorageBackend> {
    create_store(&DatabaseConfig::in_memory())
        .await
        .expect("Failed to create store")
}

fn job(name: &str, version: &str, status: &str) -> JobRecord {
    JobRecord {
        name: name.to_string(),
        namespace: "team-a".to_string(),
        uid: format!("{}-uid", name),
        kind: "TFJob".to_string(),
        status: status.to_string(),
        resource_version: version.to_string(),
        job_json: "{}".to_string(),
        is_in_k8s: true,
        is_deleted: Some(0),
        gmt_created: Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()),
        ..Default::default()
    }
}

fn pod(version: &str, status: PodStatus) -> PodRecord {
    PodRecord {
        name: "mnist-worker-0".to_string(),
        namespace: "team-a".to_string(),
        uid: "pod-uid".to_string(),
        resource_version: version.to_string(),
        status,
        job_uid: "mnist-uid".to_string(),
        job_name: "mnist".to_string(),
        replica_type: "worker".to_string(),
        pod_json: "{}".to_string(),
        ..Default::default()
    }
}

async fn read(store: &Arc<dyn ObjectStorageBackend>, name: &str) -> JobRecord {
    store
        .read_job("team-a", name, &format!("{}-uid", name), "TFJob", "")
        .await
        .unwrap()
        .expect("job record")
}

/// Retries transient failures the way a dispatcher would.
async fn write_with_retry(store: Arc<dyn ObjectStorageBackend>, record: JobRecord) -> Result<()> {
    let mut attempts = 0;
    loop {
        match store.write_job(record.clone()).await {
            Err(e) if e.is_transient() && attempts < 5 => attempts += 1,
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_newer_version_replaces_status() {
    let store = store().await;

    store.write_job(job("mnist", "3", job_state::CREATED)).await.unwrap();
    store.write_job(job("mnist", "5", job_state::RUNNING)).await.unwrap();

    let stored = read(&store, "mnist").await;
    assert_eq!(stored.status, job_state::RUNNING);
    assert_eq!(stored.resource_version, "5");
    assert!(stored.id.is_some());
}

#[tokio::test]
async fn test_stale_version_is_ignored() {
    let store = store().await;

    store.write_job(job("mnist", "3", job_state::CREATED)).await.unwrap();
    store.write_job(job("mnist", "5", job_state::RUNNING)).await.unwrap();
    store.write_job(job("mnist", "4", job_state::FAILED)).await.unwrap();

    let stored = read(&store, "mnist").await;
    assert_eq!(stored.status, job_state::RUNNING);
    assert_eq!(stored.resource_version, "5");
}

#[tokio::test]
async fn test_repeated_write_is_idempotent() {
    let store = store().await;

    store.write_job(job("mnist", "5", job_state::RUNNING)).await.unwrap();
    let first = read(&store, "mnist").await;
    store.write_job(job("mnist", "5", job_state::RUNNING)).await.unwrap();
    let second = read(&store, "mnist").await;

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_invalid_version_is_rejected() {
    let store = store().await;

    store.write_job(job("mnist", "5", job_state::RUNNING)).await.unwrap();
    let err = store.write_job(job("mnist", "v6", job_state::RUNNING)).await.unwrap_err();
    assert!(matches!(err, Error::VersionParse(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_arrival_order_does_not_matter() {
    let forward = store().await;
    forward.write_job(job("mnist", "6", job_state::RUNNING)).await.unwrap();
    forward.write_job(job("mnist", "7", job_state::SUCCEEDED)).await.unwrap();

    let reverse = store().await;
    reverse.write_job(job("mnist", "7", job_state::SUCCEEDED)).await.unwrap();
    reverse.write_job(job("mnist", "6", job_state::RUNNING)).await.unwrap();

    for store in [&forward, &reverse] {
        let stored = read(store, "mnist").await;
        assert_eq!(stored.status, job_state::SUCCEEDED);
        assert_eq!(stored.resource_version, "7");
    }
}

#[tokio::test]
async fn test_concurrent_writers_converge() {
    let store = store().await;
    store.write_job(job("mnist", "1", job_state::CREATED)).await.unwrap();

    let (a, b) = tokio::join!(
        write_with_retry(store.clone(), job("mnist", "7", job_state::SUCCEEDED)),
        write_with_retry(store.clone(), job("mnist", "6", job_state::RUNNING)),
    );
    a.unwrap();
    b.unwrap();

    let stored = read(&store, "mnist").await;
    assert_eq!(stored.status, job_state::SUCCEEDED);
    assert_eq!(stored.resource_version, "7");
}

#[tokio::test]
async fn test_terminal_status_is_not_regressed() {
    let store = store().await;
    let finished = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

    let mut done = job("mnist", "8", job_state::SUCCEEDED);
    done.gmt_job_finished = Some(finished);
    store.write_job(done).await.unwrap();
    store.write_job(job("mnist", "9", job_state::RUNNING)).await.unwrap();

    let stored = read(&store, "mnist").await;
    assert_eq!(stored.status, job_state::SUCCEEDED);
    assert_eq!(stored.gmt_job_finished, Some(finished));
    assert_eq!(stored.resource_version, "9");
}

#[tokio::test]
async fn test_stop_and_remove_job_record() {
    let store = store().await;
    store.write_job(job("mnist", "5", job_state::RUNNING)).await.unwrap();

    store
        .update_job_record_stopped("team-a", "mnist", "mnist-uid", "TFJob", "")
        .await
        .unwrap();
    let stopped = read(&store, "mnist").await;
    assert_eq!(stopped.status, job_state::STOPPED);
    assert!(!stopped.is_in_k8s);
    assert!(stopped.gmt_job_stopped.is_some());
    assert!(stopped.gmt_job_finished.is_some());

    // Stopping twice keeps the first timestamps.
    store
        .update_job_record_stopped("team-a", "mnist", "mnist-uid", "TFJob", "")
        .await
        .unwrap();
    assert_eq!(read(&store, "mnist").await.gmt_job_stopped, stopped.gmt_job_stopped);

    store
        .remove_job_record("team-a", "mnist", "mnist-uid", "TFJob", "")
        .await
        .unwrap();
    assert_eq!(read(&store, "mnist").await.is_deleted, Some(1));
}

#[tokio::test]
async fn test_stop_leaves_finished_jobs_alone() {
    let store = store().await;
    store.write_job(job("mnist", "5", job_state::FAILED)).await.unwrap();

    store
        .update_job_record_stopped("team-a", "mnist", "mnist-uid", "TFJob", "")
        .await
        .unwrap();
    assert_eq!(read(&store, "mnist").await.status, job_state::FAILED);
}

#[tokio::test]
async fn test_list_jobs_filters_and_pages() {
    let store = store().await;
    for i in 0..5 {
        let mut record = job(&format!("resnet-{}", i), "1", job_state::RUNNING);
        record.gmt_created = Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, i, 0).unwrap());
        record.user_id = Some("alice".to_string());
        store.write_job(record).await.unwrap();
    }
    let mut cron_job = job("nightly-1", "1", job_state::SUCCEEDED);
    cron_job.created_by = Some("Cron".to_string());
    store.write_job(cron_job).await.unwrap();
    let mut other = job("bert", "1", job_state::FAILED);
    other.namespace = "team-b".to_string();
    other.user_id = Some("bob".to_string());
    store.write_job(other).await.unwrap();

    let page = store
        .list_jobs(&JobQuery {
            name: Some("resnet".to_string()),
            pagination: Some(Pagination::new(1, 2)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    let names: Vec<&str> = page.items.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(names, vec!["resnet-4", "resnet-3"]);

    let last = store
        .list_jobs(&JobQuery {
            name: Some("resnet".to_string()),
            pagination: Some(Pagination::new(3, 2)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.items[0].name, "resnet-0");

    let crons = store
        .list_jobs(&JobQuery {
            is_cron: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(crons.total, 1);
    assert_eq!(crons.items[0].name, "nightly-1");

    let allocated = store
        .list_jobs(&JobQuery {
            allocated_namespaces: vec!["team-b".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(allocated.total, 1);
    assert_eq!(allocated.items[0].name, "bert");

    let failed = store
        .list_jobs(&JobQuery {
            status: Some(job_state::FAILED.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.total, 1);
}

#[tokio::test]
async fn test_user_scoped_listing() {
    let store = store().await;
    let mut mine = job("mine", "1", job_state::RUNNING);
    mine.user_id = Some("alice".to_string());
    let mut theirs = job("theirs", "1", job_state::RUNNING);
    theirs.user_id = Some("bob".to_string());
    let shared = job("shared", "1", job_state::RUNNING);
    for record in [mine, theirs, shared] {
        store.write_job(record).await.unwrap();
    }

    let page = store.with_user("alice").list_jobs(&JobQuery::default()).await.unwrap();
    let mut names: Vec<String> = page.items.into_iter().map(|j| j.name).collect();
    names.sort();
    assert_eq!(names, vec!["mine", "shared"]);
}

#[tokio::test]
async fn test_gone_pod_is_stopped() {
    let store = store().await;
    store.write_pod(pod("10", PodStatus::Running)).await.unwrap();

    store
        .update_pod_record_stopped("team-a", "mnist-worker-0", "pod-uid")
        .await
        .unwrap();
    let stopped = store
        .read_pod("team-a", "mnist-worker-0", "pod-uid")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stopped.status, PodStatus::Stopped);
    let finished = stopped.gmt_pod_finished.expect("finished timestamp");

    // A late event for the running pod does not resurrect it.
    store.write_pod(pod("11", PodStatus::Running)).await.unwrap();
    store
        .update_pod_record_stopped("team-a", "mnist-worker-0", "pod-uid")
        .await
        .unwrap();
    let stored = store
        .read_pod("team-a", "mnist-worker-0", "pod-uid")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PodStatus::Stopped);
    assert_eq!(stored.gmt_pod_finished, Some(finished));
}

#[tokio::test]
async fn test_stopping_unknown_pod_is_noop() {
    let store = store().await;
    store
        .update_pod_record_stopped("team-a", "ghost", "ghost-uid")
        .await
        .unwrap();
    assert!(store.read_pod("team-a", "ghost", "").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stopping_unknown_job_is_noop() {
    let store = store().await;
    store
        .update_job_record_stopped("team-a", "ghost", "ghost-uid", "TFJob", "")
        .await
        .unwrap();
    store
        .remove_job_record("team-a", "ghost", "ghost-uid", "TFJob", "")
        .await
        .unwrap();
    assert!(store
        .read_job("team-a", "ghost", "", "TFJob", "")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_list_pods_of_job() {
    let store = store().await;
    store.write_pod(pod("10", PodStatus::Running)).await.unwrap();
    let mut ps = pod("3", PodStatus::Pending);
    ps.name = "mnist-ps-0".to_string();
    ps.uid = "ps-uid".to_string();
    ps.replica_type = "ps".to_string();
    store.write_pod(ps).await.unwrap();

    let pods = store.list_pods("team-a", "", "mnist-uid", "").await.unwrap();
    let names: Vec<&str> = pods.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["mnist-ps-0", "mnist-worker-0"]);
}

fn cron(history: serde_json::Value) -> CronRecord {
    CronRecord {
        name: "nightly".to_string(),
        namespace: "team-a".to_string(),
        uid: "cron-uid".to_string(),
        kind: "TFJob".to_string(),
        status: "Running".to_string(),
        schedule: "0 2 * * *".to_string(),
        active: "[]".to_string(),
        history: history.to_string(),
        is_in_k8s: true,
        is_deleted: Some(0),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cron_histories_and_delete() {
    let store = store().await;
    let history = json!([
        {"uid": "h1", "object": {"kind": "TFJob", "name": "nightly-1"}, "status": "Succeeded"},
        {"uid": "h2", "object": {"kind": "TFJob", "name": "nightly-2"}, "status": "Failed"},
        {"uid": "h3", "object": {"kind": "TFJob", "name": "nightly-3"}, "status": "Failed"}
    ]);
    store.write_cron(cron(history)).await.unwrap();
    for name in ["nightly-1", "nightly-2"] {
        let mut record = job(name, "1", job_state::SUCCEEDED);
        record.created_by = Some("Cron".to_string());
        store.write_job(record).await.unwrap();
    }

    // nightly-3 was never recorded and is skipped.
    let all = store
        .list_cron_histories("team-a", "nightly", "", "", "cron-uid")
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let failed = store
        .list_cron_histories("team-a", "nightly", "", "Failed", "cron-uid")
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "nightly-2");

    store.delete_cron("team-a", "nightly", "cron-uid").await.unwrap();

    let stored = store.get_cron("team-a", "nightly", "cron-uid").await.unwrap().unwrap();
    assert_eq!(stored.is_deleted, Some(1));
    assert!(!stored.is_in_k8s);
    assert_eq!(read(&store, "nightly-1").await.is_deleted, Some(1));

    let listed = store.list_crons(&CronQuery::default()).await.unwrap();
    assert_eq!(listed.total, 0);
}

#[tokio::test]
async fn test_cron_rewrite_updates_row() {
    let store = store().await;
    store.write_cron(cron(json!([]))).await.unwrap();

    let mut suspended = cron(json!([]));
    suspended.status = "Suspend".to_string();
    suspended.suspend = Some(1);
    store.write_cron(suspended).await.unwrap();

    let listed = store.list_crons(&CronQuery::default()).await.unwrap();
    assert_eq!(listed.total, 1);
    assert_eq!(listed.items[0].status, "Suspend");
    assert_eq!(listed.items[0].suspend, Some(1));
}

#[tokio::test]
async fn test_notebook_lifecycle() {
    let store = store().await;
    let notebook = NotebookRecord {
        name: "lab".to_string(),
        namespace: "team-a".to_string(),
        image: "jupyter:latest".to_string(),
        volumes: "[]".to_string(),
        user_name: "alice".to_string(),
        status: NotebookStatus::Starting,
        image_pull_secrets: "[]".to_string(),
        ..Default::default()
    };
    store.write_notebook(notebook.clone()).await.unwrap();
    store.update_notebook_token("team-a", "lab", "secret").await.unwrap();

    // A later write without owner or token keeps both.
    store
        .write_notebook(NotebookRecord {
            user_name: String::new(),
            status: NotebookStatus::Running,
            ..notebook
        })
        .await
        .unwrap();
    let stored = store.get_notebook("team-a", "lab").await.unwrap().unwrap();
    assert_eq!(stored.user_name, "alice");
    assert_eq!(stored.token, "secret");
    assert_eq!(stored.status, NotebookStatus::Running);

    let mine = store
        .list_notebooks(&NotebookQuery {
            user_name: Some("alice".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);

    store.delete_notebook("team-a", "lab").await.unwrap();
    let listed = store.list_notebooks(&NotebookQuery::default()).await.unwrap();
    assert!(listed.is_empty());

    let deleted = store.get_notebook("team-a", "lab").await.unwrap().unwrap();
    assert_eq!(deleted.status, NotebookStatus::Deleted);
}

#[tokio::test]
async fn test_evaluate_job_lifecycle() {
    let store = store().await;
    let eval = EvaluateJobRecord {
        job_id: "job-1".to_string(),
        name: "eval-1".to_string(),
        namespace: "team-a".to_string(),
        uid: "eval-uid".to_string(),
        model_name: "resnet".to_string(),
        model_version: "v1".to_string(),
        status: "Created".to_string(),
        metrics: r#"{"accuracy":0.93}"#.to_string(),
        ..Default::default()
    };
    store.write_evaluate_job(eval.clone()).await.unwrap();
    store
        .write_evaluate_job(EvaluateJobRecord {
            status: "Complete".to_string(),
            metrics: String::new(),
            ..eval
        })
        .await
        .unwrap();

    let stored = store
        .get_evaluate_job("team-a", "eval-1", "eval-uid")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, "Complete");
    assert_eq!(stored.metrics, r#"{"accuracy":0.93}"#);

    store.delete_evaluate_job("team-a", "eval-1", "eval-uid").await.unwrap();
    let listed = store.list_evaluate_jobs(&EvaluateJobQuery::default()).await.unwrap();
    assert_eq!(listed.total, 0);
}

#[tokio::test]
async fn test_model_catalogue() {
    let store = store().await;
    let id = store
        .write_model(ModelRecord {
            model_name: "resnet".to_string(),
            model_version: "v1".to_string(),
            oss_path: "oss://models/resnet/v1".to_string(),
            job_id: "job-1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let model = store.get_model(id).await.unwrap().unwrap();
    assert_eq!(model.oss_path, "oss://models/resnet/v1");

    let page = store
        .list_models(&ModelQuery {
            model_name: Some("res".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);

    store.delete_model(id).await.unwrap();
    assert!(store.get_model(id).await.unwrap().is_none());
    assert!(matches!(store.delete_model(id).await, Err(Error::NotFound(_))));
}
