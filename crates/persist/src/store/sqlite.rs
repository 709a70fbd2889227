use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, error, info, warn};

use crate::crd::CronHistory;
use crate::metrics;
use crate::store::{
    job_state, CronQuery, CronRecord, EvaluateJobQuery, EvaluateJobRecord, JobQuery, JobRecord,
    ModelQuery, ModelRecord, NotebookQuery, NotebookRecord, ObjectStorageBackend, Page,
    Pagination, PodRecord, PodStatus,
};
use crate::upsert::{self, set_once, Decision};
use crate::{Error, Result};

pub const NAME: &str = "sqlite";
const CRON_CREATOR: &str = "Cron";

#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    user: Option<String>,
}

impl SqliteBackend {
    pub async fn connect(path: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to SQLite database: {}", path);

        let pool = if path == ":memory:" {
            // Every connection to :memory: opens a separate database, so the
            // pool keeps exactly one alive.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
        } else {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await
        }
        .map_err(|e| {
            error!("Failed to connect to SQLite: {}", e);
            Error::Sqlx(e)
        })?;

        Ok(Self { pool, user: None })
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO job (
                name, namespace, display_name, uid, kind, status, resource_version, job_json,
                region_id, cluster_id, tenant_id, group_id, user_id, created_by,
                reason_code, reason, extended, is_in_k8s, is_deleted, resources, job_config,
                gmt_created, gmt_modified, gmt_job_submitted, gmt_job_running,
                gmt_job_stopped, gmt_job_finished
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
            )
            "#,
        )
        .bind(&job.name)
        .bind(&job.namespace)
        .bind(&job.display_name)
        .bind(&job.uid)
        .bind(&job.kind)
        .bind(&job.status)
        .bind(&job.resource_version)
        .bind(&job.job_json)
        .bind(&job.region_id)
        .bind(&job.cluster_id)
        .bind(&job.tenant_id)
        .bind(&job.group_id)
        .bind(&job.user_id)
        .bind(&job.created_by)
        .bind(&job.reason_code)
        .bind(&job.reason)
        .bind(&job.extended)
        .bind(job.is_in_k8s)
        .bind(job.is_deleted)
        .bind(&job.resources)
        .bind(&job.job_config)
        .bind(job.gmt_created.unwrap_or(now))
        .bind(now)
        .bind(job.gmt_job_submitted)
        .bind(job.gmt_job_running)
        .bind(job.gmt_job_stopped)
        .bind(job.gmt_job_finished)
        .execute(&self.pool)
        .await?;

        info!("Created {} record {}/{} ({})", job.kind, job.namespace, job.name, job.status);
        Ok(())
    }

    /// Writes `job` over the row with id `job.id`, provided the row still
    /// holds `expected_version`.
    async fn update_job(&self, expected_version: &str, job: &JobRecord) -> Result<()> {
        let id = job
            .id
            .ok_or_else(|| {
                Error::Internal(format!("job {}/{} has no row id", job.namespace, job.name))
            })?;

        let result = sqlx::query(
            r#"
            UPDATE job SET
                display_name = ?1,
                status = ?2,
                resource_version = ?3,
                job_json = ?4,
                region_id = COALESCE(?5, region_id),
                cluster_id = COALESCE(?6, cluster_id),
                tenant_id = COALESCE(?7, tenant_id),
                group_id = COALESCE(?8, group_id),
                user_id = COALESCE(?9, user_id),
                created_by = COALESCE(?10, created_by),
                reason_code = ?11,
                reason = ?12,
                extended = ?13,
                is_in_k8s = ?14,
                is_deleted = ?15,
                resources = ?16,
                job_config = ?17,
                gmt_modified = ?18,
                gmt_job_submitted = ?19,
                gmt_job_running = ?20,
                gmt_job_stopped = ?21,
                gmt_job_finished = ?22
            WHERE id = ?23 AND resource_version = ?24
            "#,
        )
        .bind(&job.display_name)
        .bind(&job.status)
        .bind(&job.resource_version)
        .bind(&job.job_json)
        .bind(&job.region_id)
        .bind(&job.cluster_id)
        .bind(&job.tenant_id)
        .bind(&job.group_id)
        .bind(&job.user_id)
        .bind(&job.created_by)
        .bind(&job.reason_code)
        .bind(&job.reason)
        .bind(&job.extended)
        .bind(job.is_in_k8s)
        .bind(job.is_deleted)
        .bind(&job.resources)
        .bind(&job.job_config)
        .bind(Utc::now())
        .bind(job.gmt_job_submitted)
        .bind(job.gmt_job_running)
        .bind(job.gmt_job_stopped)
        .bind(job.gmt_job_finished)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "job {}/{} changed since version {}",
                job.namespace, job.name, expected_version
            )));
        }
        Ok(())
    }

    async fn insert_pod(&self, pod: &PodRecord) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO pod (
                name, namespace, uid, resource_version, status, image, gpu, job_uid, job_name,
                replica_type, pod_json, host_ip, pod_ip, extended,
                gmt_created, gmt_modified, gmt_pod_running, gmt_pod_finished
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18
            )
            "#,
        )
        .bind(&pod.name)
        .bind(&pod.namespace)
        .bind(&pod.uid)
        .bind(&pod.resource_version)
        .bind(pod.status.to_string())
        .bind(&pod.image)
        .bind(pod.gpu)
        .bind(&pod.job_uid)
        .bind(&pod.job_name)
        .bind(&pod.replica_type)
        .bind(&pod.pod_json)
        .bind(&pod.host_ip)
        .bind(&pod.pod_ip)
        .bind(&pod.extended)
        .bind(pod.gmt_created.unwrap_or(now))
        .bind(now)
        .bind(pod.gmt_pod_running)
        .bind(pod.gmt_pod_finished)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_pod(&self, expected_version: &str, pod: &PodRecord) -> Result<()> {
        let id = pod
            .id
            .ok_or_else(|| {
                Error::Internal(format!("pod {}/{} has no row id", pod.namespace, pod.name))
            })?;

        let result = sqlx::query(
            r#"
            UPDATE pod SET
                resource_version = ?1,
                status = ?2,
                image = ?3,
                gpu = ?4,
                host_ip = ?5,
                pod_ip = ?6,
                pod_json = ?7,
                extended = ?8,
                gmt_modified = ?9,
                gmt_pod_running = ?10,
                gmt_pod_finished = ?11
            WHERE id = ?12 AND resource_version = ?13
            "#,
        )
        .bind(&pod.resource_version)
        .bind(pod.status.to_string())
        .bind(&pod.image)
        .bind(pod.gpu)
        .bind(&pod.host_ip)
        .bind(&pod.pod_ip)
        .bind(&pod.pod_json)
        .bind(&pod.extended)
        .bind(Utc::now())
        .bind(pod.gmt_pod_running)
        .bind(pod.gmt_pod_finished)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "pod {}/{} changed since version {}",
                pod.namespace, pod.name, expected_version
            )));
        }
        Ok(())
    }

    async fn update_cron(&self, id: i64, cron: &CronRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cron SET
                kind = ?1,
                status = ?2,
                region_id = COALESCE(?3, region_id),
                cluster_id = COALESCE(?4, cluster_id),
                schedule = ?5,
                concurrency_policy = ?6,
                active = ?7,
                history = ?8,
                history_limit = ?9,
                is_in_k8s = ?10,
                is_deleted = ?11,
                suspend = ?12,
                deadline = ?13,
                user_id = COALESCE(?14, user_id),
                last_schedule_time = ?15,
                gmt_modified = ?16
            WHERE id = ?17
            "#,
        )
        .bind(&cron.kind)
        .bind(&cron.status)
        .bind(&cron.region_id)
        .bind(&cron.cluster_id)
        .bind(&cron.schedule)
        .bind(&cron.concurrency_policy)
        .bind(&cron.active)
        .bind(&cron.history)
        .bind(cron.history_limit)
        .bind(cron.is_in_k8s)
        .bind(cron.is_deleted)
        .bind(cron.suspend)
        .bind(cron.deadline)
        .bind(&cron.user_id)
        .bind(cron.last_schedule_time)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks the job launched by a cron as removed. Jobs are matched by
    /// namespace, name and kind since the history carries no uid of its own.
    async fn remove_job_of_cron(&self, namespace: &str, name: &str, kind: &str) -> Result<()> {
        let Some(old) = self.read_job(namespace, name, "", kind, "").await? else {
            debug!("No record of cron job {}/{} ({})", namespace, name, kind);
            return Ok(());
        };

        let mut job = old.clone();
        job.is_deleted = Some(1);
        job.is_in_k8s = false;
        if job == old {
            return Ok(());
        }
        self.update_job(&old.resource_version, &job).await
    }

    fn scoped_user<'a>(&'a self, requested: Option<&'a String>) -> Option<&'a String> {
        requested.or(self.user.as_ref())
    }

    async fn count(&self, mut qb: QueryBuilder<'_, Sqlite>) -> Result<i64> {
        let row = qb.build().fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("total"))
    }
}

fn push_pagination(qb: &mut QueryBuilder<'_, Sqlite>, pagination: Option<&Pagination>) {
    if let Some(p) = pagination {
        qb.push(" LIMIT ").push_bind(p.page_size);
        qb.push(" OFFSET ").push_bind(p.offset());
    }
}

fn push_namespaces(
    qb: &mut QueryBuilder<'_, Sqlite>,
    namespace: Option<&String>,
    allocated: &[String],
) {
    if let Some(ns) = namespace.filter(|n| !n.is_empty()) {
        qb.push(" AND namespace LIKE ").push_bind(format!("%{}%", ns));
    } else if !allocated.is_empty() {
        qb.push(" AND namespace IN (");
        let mut separated = qb.separated(", ");
        for ns in allocated {
            separated.push_bind(ns.clone());
        }
        separated.push_unseparated(")");
    }
}

fn push_job_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &JobQuery, user: Option<&String>) {
    if let Some(start) = query.start_time {
        qb.push(" AND gmt_created > ").push_bind(start);
    }
    if let Some(end) = query.end_time {
        qb.push(" AND gmt_created < ").push_bind(end);
    }
    if let Some(deleted) = query.deleted {
        qb.push(" AND is_deleted = ").push_bind(deleted);
    }
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND status = ").push_bind(status.clone());
    }
    if let Some(name) = query.name.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND name LIKE ").push_bind(format!("%{}%", name));
    }
    push_namespaces(qb, query.namespace.as_ref(), &query.allocated_namespaces);
    if let Some(kind) = query.kind.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND kind = ").push_bind(kind.clone());
    }
    if let Some(job_id) = query.job_id.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND uid = ").push_bind(job_id.clone());
    }
    if let Some(region) = query.region_id.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND region_id = ").push_bind(region.clone());
    }
    if query.is_cron {
        qb.push(" AND created_by = ").push_bind(CRON_CREATOR);
    } else {
        qb.push(" AND (created_by IS NULL OR created_by <> ").push_bind(CRON_CREATOR).push(")");
    }
    if let Some(user) = user {
        qb.push(" AND (user_id = ").push_bind(user.clone()).push(" OR user_id IS NULL)");
    }
}

fn push_cron_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &CronQuery, user: Option<&String>) {
    if let Some(start) = query.start_time {
        qb.push(" AND gmt_created > ").push_bind(start);
    }
    if let Some(end) = query.end_time {
        qb.push(" AND gmt_created < ").push_bind(end);
    }
    if let Some(cron_id) = query.cron_id.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND uid = ").push_bind(cron_id.clone());
    }
    if let Some(name) = query.name.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND name LIKE ").push_bind(format!("%{}%", name));
    }
    push_namespaces(qb, query.namespace.as_ref(), &query.allocated_namespaces);
    if let Some(kind) = query.kind.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND kind = ").push_bind(kind.clone());
    }
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND status = ").push_bind(status.clone());
    }
    if let Some(region) = query.region_id.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND region_id = ").push_bind(region.clone());
    }
    if let Some(user) = user {
        qb.push(" AND (user_id = ").push_bind(user.clone()).push(" OR user_id IS NULL)");
    }
    qb.push(" AND is_deleted = ").push_bind(query.deleted.unwrap_or(0));
}

fn push_evaluate_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &EvaluateJobQuery) {
    qb.push(" AND is_deleted = 0");
    if let Some(start) = query.start_time {
        qb.push(" AND gmt_created > ").push_bind(start);
    }
    if let Some(end) = query.end_time {
        qb.push(" AND gmt_created < ").push_bind(end);
    }
    push_namespaces(qb, None, &query.allocated_namespaces);
}

fn push_model_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &ModelQuery) {
    if let Some(name) = query.model_name.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND model_name LIKE ").push_bind(format!("%{}%", name));
    }
    if let Some(version) = query.model_version.as_ref().filter(|s| !s.is_empty()) {
        qb.push(" AND model_version = ").push_bind(version.clone());
    }
}

fn job_from_row(r: &SqliteRow) -> JobRecord {
    JobRecord {
        id: r.get("id"),
        name: r.get("name"),
        namespace: r.get("namespace"),
        display_name: r.get("display_name"),
        uid: r.get("uid"),
        kind: r.get("kind"),
        status: r.get("status"),
        resource_version: r.get("resource_version"),
        job_json: r.get("job_json"),
        region_id: r.get("region_id"),
        cluster_id: r.get("cluster_id"),
        tenant_id: r.get("tenant_id"),
        group_id: r.get("group_id"),
        user_id: r.get("user_id"),
        created_by: r.get("created_by"),
        reason_code: r.get("reason_code"),
        reason: r.get("reason"),
        extended: r.get("extended"),
        is_in_k8s: r.get("is_in_k8s"),
        is_deleted: r.get("is_deleted"),
        resources: r.get("resources"),
        job_config: r.get("job_config"),
        gmt_created: r.get("gmt_created"),
        gmt_modified: r.get("gmt_modified"),
        gmt_job_submitted: r.get("gmt_job_submitted"),
        gmt_job_running: r.get("gmt_job_running"),
        gmt_job_stopped: r.get("gmt_job_stopped"),
        gmt_job_finished: r.get("gmt_job_finished"),
    }
}

fn pod_from_row(r: &SqliteRow) -> Result<PodRecord> {
    Ok(PodRecord {
        id: r.get("id"),
        name: r.get("name"),
        namespace: r.get("namespace"),
        uid: r.get("uid"),
        resource_version: r.get("resource_version"),
        status: r.get::<String, _>("status").parse()?,
        image: r.get("image"),
        gpu: r.get("gpu"),
        job_uid: r.get("job_uid"),
        job_name: r.get("job_name"),
        replica_type: r.get("replica_type"),
        pod_json: r.get("pod_json"),
        host_ip: r.get("host_ip"),
        pod_ip: r.get("pod_ip"),
        extended: r.get("extended"),
        gmt_created: r.get("gmt_created"),
        gmt_modified: r.get("gmt_modified"),
        gmt_pod_running: r.get("gmt_pod_running"),
        gmt_pod_finished: r.get("gmt_pod_finished"),
    })
}

fn cron_from_row(r: &SqliteRow) -> CronRecord {
    CronRecord {
        id: r.get("id"),
        name: r.get("name"),
        namespace: r.get("namespace"),
        uid: r.get("uid"),
        kind: r.get("kind"),
        status: r.get("status"),
        region_id: r.get("region_id"),
        cluster_id: r.get("cluster_id"),
        schedule: r.get("schedule"),
        concurrency_policy: r.get("concurrency_policy"),
        active: r.get("active"),
        history: r.get("history"),
        history_limit: r.get("history_limit"),
        is_in_k8s: r.get("is_in_k8s"),
        is_deleted: r.get("is_deleted"),
        suspend: r.get("suspend"),
        deadline: r.get("deadline"),
        user_id: r.get("user_id"),
        last_schedule_time: r.get("last_schedule_time"),
        gmt_created: r.get("gmt_created"),
        gmt_modified: r.get("gmt_modified"),
    }
}

fn notebook_from_row(r: &SqliteRow) -> Result<NotebookRecord> {
    Ok(NotebookRecord {
        id: r.get("id"),
        name: r.get("name"),
        namespace: r.get("namespace"),
        image: r.get("image"),
        volumes: r.get("volumes"),
        cpu: r.get("cpu"),
        gpu: r.get("gpu"),
        memory: r.get("memory"),
        user_name: r.get("user_name"),
        user_id: r.get("user_id"),
        token: r.get("token"),
        status: r.get::<String, _>("status").parse()?,
        image_pull_secrets: r.get("image_pull_secrets"),
        gmt_created: r.get("gmt_created"),
        gmt_modified: r.get("gmt_modified"),
    })
}

fn evaluate_from_row(r: &SqliteRow) -> EvaluateJobRecord {
    EvaluateJobRecord {
        id: r.get("id"),
        job_id: r.get("job_id"),
        name: r.get("name"),
        namespace: r.get("namespace"),
        uid: r.get("uid"),
        user_id: r.get("user_id"),
        model_name: r.get("model_name"),
        model_version: r.get("model_version"),
        status: r.get("status"),
        image: r.get("image"),
        dataset_path: r.get("dataset_path"),
        code: r.get("code"),
        command: r.get("command"),
        metrics: r.get("metrics"),
        is_deleted: r.get("is_deleted"),
        report_path: r.get("report_path"),
        gmt_created: r.get("gmt_created"),
        gmt_modified: r.get("gmt_modified"),
    }
}

fn model_from_row(r: &SqliteRow) -> ModelRecord {
    ModelRecord {
        id: r.get("id"),
        model_name: r.get("model_name"),
        model_version: r.get("model_version"),
        oss_path: r.get("oss_path"),
        job_id: r.get("job_id"),
        user_id: r.get("user_id"),
        gmt_created: r.get("gmt_created"),
        gmt_modified: r.get("gmt_modified"),
    }
}

#[async_trait]
impl ObjectStorageBackend for SqliteBackend {
    async fn initialize(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing SQLite pool");
        self.pool.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn with_user(&self, user: &str) -> Arc<dyn ObjectStorageBackend> {
        Arc::new(Self {
            pool: self.pool.clone(),
            user: Some(user.to_string()),
        })
    }

    // Job operations
    async fn write_job(&self, job: JobRecord) -> Result<()> {
        debug!(
            "Writing {} {}/{} at version {}",
            job.kind, job.namespace, job.name, job.resource_version
        );

        let kind = job.kind.clone();
        let old = self
            .read_job(
                &job.namespace,
                &job.name,
                &job.uid,
                &job.kind,
                job.region_id.as_deref().unwrap_or_default(),
            )
            .await?;

        match upsert::decide(old.as_ref(), job)? {
            Decision::Insert(job) => self.insert_job(&job).await,
            Decision::Update(mut job) => {
                let old = old.ok_or_else(|| Error::Internal("update without stored job".into()))?;
                job.id = old.id;
                self.update_job(&old.resource_version, &job).await?;
                if old.status != job.status {
                    info!(
                        "Job {} {}/{} moved from {} to {}",
                        job.kind, job.namespace, job.name, old.status, job.status
                    );
                }
                Ok(())
            }
            Decision::Skip => Ok(()),
            Decision::Discard => {
                metrics::record_stale_write(&kind);
                Ok(())
            }
        }
    }

    async fn read_job(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        kind: &str,
        region: &str,
    ) -> Result<Option<JobRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM job WHERE namespace = ");
        qb.push_bind(namespace.to_string());
        qb.push(" AND name = ").push_bind(name.to_string());
        if !uid.is_empty() {
            qb.push(" AND uid = ").push_bind(uid.to_string());
        }
        if !kind.is_empty() {
            qb.push(" AND kind = ").push_bind(kind.to_string());
        }
        if !region.is_empty() {
            qb.push(" AND region_id = ").push_bind(region.to_string());
        }
        qb.push(" ORDER BY id DESC LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(job_from_row))
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Page<JobRecord>> {
        debug!("Listing jobs: {:?}", query);
        let user = self.scoped_user(query.user_id.as_ref());

        let mut count =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM job WHERE 1 = 1");
        push_job_filters(&mut count, query, user);
        let total = self.count(count).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM job WHERE 1 = 1");
        push_job_filters(&mut qb, query, user);
        qb.push(" ORDER BY gmt_created DESC, id DESC");
        push_pagination(&mut qb, query.pagination.as_ref());

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(Page {
            items: rows.iter().map(job_from_row).collect(),
            total,
        })
    }

    async fn update_job_record_stopped(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        kind: &str,
        region: &str,
    ) -> Result<()> {
        debug!("Marking {} {}/{} stopped", kind, namespace, name);

        let Some(old) = self.read_job(namespace, name, uid, kind, region).await? else {
            debug!("{} {}/{} was never recorded", kind, namespace, name);
            return Ok(());
        };

        let mut job = old.clone();
        if matches!(
            old.status.as_str(),
            job_state::RUNNING
                | job_state::CREATED
                | job_state::RESTARTING
                | job_state::STOPPING
                | job_state::STOPPED
        ) {
            let now = Utc::now();
            job.status = job_state::STOPPED.to_string();
            job.is_in_k8s = false;
            set_once(&mut job.gmt_job_stopped, now);
            set_once(&mut job.gmt_job_finished, now);
        }

        if job == old {
            return Ok(());
        }
        self.update_job(&old.resource_version, &job).await
    }

    async fn remove_job_record(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        kind: &str,
        region: &str,
    ) -> Result<()> {
        debug!("Removing {} {}/{}", kind, namespace, name);

        let Some(old) = self.read_job(namespace, name, uid, kind, region).await? else {
            debug!("{} {}/{} was never recorded", kind, namespace, name);
            return Ok(());
        };

        let mut job = old.clone();
        job.is_deleted = Some(1);
        job.is_in_k8s = false;

        if job == old {
            return Ok(());
        }
        self.update_job(&old.resource_version, &job).await
    }

    // Pod operations
    async fn write_pod(&self, pod: PodRecord) -> Result<()> {
        debug!("Writing pod {}/{} at version {}", pod.namespace, pod.name, pod.resource_version);

        let old = self.read_pod(&pod.namespace, &pod.name, &pod.uid).await?;
        match upsert::decide(old.as_ref(), pod)? {
            Decision::Insert(pod) => self.insert_pod(&pod).await,
            Decision::Update(mut pod) => {
                let old = old.ok_or_else(|| Error::Internal("update without stored pod".into()))?;
                pod.id = old.id;
                self.update_pod(&old.resource_version, &pod).await
            }
            Decision::Skip => Ok(()),
            Decision::Discard => {
                metrics::record_stale_write("Pod");
                Ok(())
            }
        }
    }

    async fn read_pod(&self, namespace: &str, name: &str, uid: &str) -> Result<Option<PodRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM pod WHERE namespace = ");
        qb.push_bind(namespace.to_string());
        qb.push(" AND name = ").push_bind(name.to_string());
        if !uid.is_empty() {
            qb.push(" AND uid = ").push_bind(uid.to_string());
        }
        qb.push(" ORDER BY id DESC LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(pod_from_row).transpose()
    }

    async fn list_pods(
        &self,
        namespace: &str,
        name: &str,
        job_uid: &str,
        region: &str,
    ) -> Result<Vec<PodRecord>> {
        debug!("Listing pods of job {}", job_uid);

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT pod.* FROM pod");
        if !region.is_empty() {
            qb.push(" JOIN job ON job.uid = pod.job_uid AND job.region_id = ")
                .push_bind(region.to_string());
        }
        qb.push(" WHERE 1 = 1");
        if !namespace.is_empty() {
            qb.push(" AND pod.namespace = ").push_bind(namespace.to_string());
        }
        if !name.is_empty() {
            qb.push(" AND pod.name = ").push_bind(name.to_string());
        }
        if !job_uid.is_empty() {
            qb.push(" AND pod.job_uid = ").push_bind(job_uid.to_string());
        }
        qb.push(" ORDER BY pod.replica_type, pod.name, pod.gmt_created DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(pod_from_row).collect()
    }

    async fn update_pod_record_stopped(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> Result<()> {
        debug!("Marking pod {}/{} stopped", namespace, name);

        let Some(old) = self.read_pod(namespace, name, uid).await? else {
            debug!("Pod {}/{} was never recorded", namespace, name);
            return Ok(());
        };

        let mut pod = old.clone();
        if matches!(old.status, PodStatus::Pending | PodStatus::Running | PodStatus::Unknown) {
            pod.status = PodStatus::Stopped;
            set_once(&mut pod.gmt_pod_finished, Utc::now());
        }

        if pod == old {
            return Ok(());
        }
        self.update_pod(&old.resource_version, &pod).await
    }

    // Cron operations
    async fn write_cron(&self, mut cron: CronRecord) -> Result<()> {
        debug!("Writing cron {}/{}", cron.namespace, cron.name);

        match self.get_cron(&cron.namespace, &cron.name, &cron.uid).await? {
            Some(old) => {
                cron.is_in_k8s = true;
                let id = old
                    .id
                    .ok_or_else(|| {
                        let key = format!("{}/{}", cron.namespace, cron.name);
                        Error::Internal(format!("cron {} has no row id", key))
                    })?;
                self.update_cron(id, &cron).await
            }
            None => {
                let now = Utc::now();
                sqlx::query(
                    r#"
                    INSERT INTO cron (
                        name, namespace, uid, kind, status, region_id, cluster_id, schedule,
                        concurrency_policy, active, history, history_limit, is_in_k8s, is_deleted,
                        suspend, deadline, user_id, last_schedule_time, gmt_created, gmt_modified
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                        ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20
                    )
                    "#,
                )
                .bind(&cron.name)
                .bind(&cron.namespace)
                .bind(&cron.uid)
                .bind(&cron.kind)
                .bind(&cron.status)
                .bind(&cron.region_id)
                .bind(&cron.cluster_id)
                .bind(&cron.schedule)
                .bind(&cron.concurrency_policy)
                .bind(&cron.active)
                .bind(&cron.history)
                .bind(cron.history_limit)
                .bind(cron.is_in_k8s)
                .bind(cron.is_deleted)
                .bind(cron.suspend)
                .bind(cron.deadline)
                .bind(&cron.user_id)
                .bind(cron.last_schedule_time)
                .bind(cron.gmt_created.unwrap_or(now))
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
        }
    }

    async fn get_cron(&self, namespace: &str, name: &str, uid: &str) -> Result<Option<CronRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM cron WHERE namespace = ");
        qb.push_bind(namespace.to_string());
        qb.push(" AND name = ").push_bind(name.to_string());
        if !uid.is_empty() {
            qb.push(" AND uid = ").push_bind(uid.to_string());
        }
        qb.push(" ORDER BY id DESC LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(cron_from_row))
    }

    async fn list_crons(&self, query: &CronQuery) -> Result<Page<CronRecord>> {
        debug!("Listing crons: {:?}", query);
        let user = self.scoped_user(query.user_id.as_ref());

        let mut count =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM cron WHERE 1 = 1");
        push_cron_filters(&mut count, query, user);
        let total = self.count(count).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM cron WHERE 1 = 1");
        push_cron_filters(&mut qb, query, user);
        qb.push(" ORDER BY gmt_created DESC, id DESC");
        push_pagination(&mut qb, query.pagination.as_ref());

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(Page {
            items: rows.iter().map(cron_from_row).collect(),
            total,
        })
    }

    async fn delete_cron(&self, namespace: &str, name: &str, uid: &str) -> Result<()> {
        info!("Deleting cron {}/{}", namespace, name);

        let Some(mut cron) = self.get_cron(namespace, name, uid).await? else {
            debug!("Cron {}/{} was never recorded", namespace, name);
            return Ok(());
        };

        let histories: Vec<CronHistory> = serde_json::from_str(&cron.history).unwrap_or_else(|e| {
            warn!("Ignoring unreadable history of cron {}/{}: {}", namespace, name, e);
            Vec::new()
        });
        for history in &histories {
            if let Err(e) = self
                .remove_job_of_cron(&cron.namespace, &history.object.name, &cron.kind)
                .await
            {
                warn!(
                    "Failed to remove job {} of cron {}/{}: {}",
                    history.object.name, namespace, name, e
                );
            }
        }

        cron.is_in_k8s = false;
        cron.is_deleted = Some(1);
        let id = cron
            .id
            .ok_or_else(|| Error::Internal(format!("cron {}/{} has no row id", namespace, name)))?;
        self.update_cron(id, &cron).await
    }

    async fn list_cron_histories(
        &self,
        namespace: &str,
        name: &str,
        job_name: &str,
        job_status: &str,
        cron_id: &str,
    ) -> Result<Vec<JobRecord>> {
        let cron = self
            .get_cron(namespace, name, cron_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cron {}/{}", namespace, name)))?;

        let histories: Vec<CronHistory> = serde_json::from_str(&cron.history)?;
        let mut jobs = Vec::new();
        for history in histories {
            if !job_name.is_empty() && job_name != history.object.name {
                continue;
            }
            if !job_status.is_empty() && job_status != history.status {
                continue;
            }
            match self
                .read_job(namespace, &history.object.name, "", &history.object.kind, "")
                .await?
            {
                Some(job) => jobs.push(job),
                None => debug!("No record of cron job {}/{}", namespace, history.object.name),
            }
        }
        Ok(jobs)
    }

    // Notebook operations
    async fn write_notebook(&self, notebook: NotebookRecord) -> Result<()> {
        debug!("Writing notebook {}/{}", notebook.namespace, notebook.name);
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO notebook (
                name, namespace, image, volumes, cpu, gpu, memory, user_name, user_id, token,
                status, image_pull_secrets, is_deleted, gmt_created, gmt_modified
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?14)
            ON CONFLICT(namespace, name) DO UPDATE SET
                image = excluded.image,
                volumes = excluded.volumes,
                cpu = excluded.cpu,
                gpu = excluded.gpu,
                memory = excluded.memory,
                user_name = COALESCE(NULLIF(excluded.user_name, ''), notebook.user_name),
                user_id = COALESCE(excluded.user_id, notebook.user_id),
                token = COALESCE(NULLIF(excluded.token, ''), notebook.token),
                status = excluded.status,
                image_pull_secrets = excluded.image_pull_secrets,
                is_deleted = 0,
                gmt_modified = excluded.gmt_modified
            "#,
        )
        .bind(&notebook.name)
        .bind(&notebook.namespace)
        .bind(&notebook.image)
        .bind(&notebook.volumes)
        .bind(&notebook.cpu)
        .bind(&notebook.gpu)
        .bind(&notebook.memory)
        .bind(&notebook.user_name)
        .bind(&notebook.user_id)
        .bind(&notebook.token)
        .bind(notebook.status.to_string())
        .bind(&notebook.image_pull_secrets)
        .bind(notebook.gmt_created.unwrap_or(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_notebook(&self, namespace: &str, name: &str) -> Result<Option<NotebookRecord>> {
        let row = sqlx::query("SELECT * FROM notebook WHERE namespace = ?1 AND name = ?2")
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(notebook_from_row).transpose()
    }

    async fn list_notebooks(&self, query: &NotebookQuery) -> Result<Vec<NotebookRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM notebook WHERE is_deleted = 0");
        if let Some(ns) = query.namespace.as_ref().filter(|s| !s.is_empty()) {
            qb.push(" AND namespace = ").push_bind(ns.clone());
        }

        let user_name = query.user_name.as_ref().or(self.user.as_ref()).filter(|s| !s.is_empty());
        let user_id = query.user_id.as_ref().filter(|s| !s.is_empty());
        if user_name.is_some() || user_id.is_some() {
            qb.push(" AND (user_name = ")
                .push_bind(user_name.cloned().unwrap_or_default())
                .push(" OR user_id = ")
                .push_bind(user_id.cloned().unwrap_or_default())
                .push(")");
        }
        qb.push(" ORDER BY gmt_created DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(notebook_from_row).collect()
    }

    async fn delete_notebook(&self, namespace: &str, name: &str) -> Result<()> {
        info!("Deleting notebook {}/{}", namespace, name);
        sqlx::query(
            "UPDATE notebook SET is_deleted = 1, status = ?1, gmt_modified = ?2 \
             WHERE namespace = ?3 AND name = ?4",
        )
        .bind(crate::store::NotebookStatus::Deleted.to_string())
        .bind(Utc::now())
        .bind(namespace)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_notebook_token(&self, namespace: &str, name: &str, token: &str) -> Result<()> {
        sqlx::query(
            "UPDATE notebook SET token = ?1, gmt_modified = ?2 WHERE namespace = ?3 AND name = ?4",
        )
        .bind(token)
        .bind(Utc::now())
        .bind(namespace)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Evaluate job operations
    async fn write_evaluate_job(&self, job: EvaluateJobRecord) -> Result<()> {
        debug!("Writing evaluate job {}/{}", job.namespace, job.name);
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO evaluate (
                job_id, name, namespace, uid, user_id, model_name, model_version, status, image,
                dataset_path, code, command, metrics, is_deleted, report_path,
                gmt_created, gmt_modified
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14, ?15, ?16)
            ON CONFLICT(namespace, name) DO UPDATE SET
                job_id = excluded.job_id,
                uid = excluded.uid,
                user_id = COALESCE(excluded.user_id, evaluate.user_id),
                model_name = excluded.model_name,
                model_version = excluded.model_version,
                status = excluded.status,
                image = excluded.image,
                dataset_path = excluded.dataset_path,
                code = excluded.code,
                command = excluded.command,
                metrics = CASE WHEN excluded.metrics = ''
                    THEN evaluate.metrics ELSE excluded.metrics END,
                is_deleted = 0,
                report_path = excluded.report_path,
                gmt_modified = excluded.gmt_modified
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.name)
        .bind(&job.namespace)
        .bind(&job.uid)
        .bind(&job.user_id)
        .bind(&job.model_name)
        .bind(&job.model_version)
        .bind(&job.status)
        .bind(&job.image)
        .bind(&job.dataset_path)
        .bind(&job.code)
        .bind(&job.command)
        .bind(&job.metrics)
        .bind(&job.report_path)
        .bind(job.gmt_created.unwrap_or(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_evaluate_job(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> Result<Option<EvaluateJobRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM evaluate WHERE namespace = ");
        qb.push_bind(namespace.to_string());
        qb.push(" AND name = ").push_bind(name.to_string());
        if !uid.is_empty() {
            qb.push(" AND uid = ").push_bind(uid.to_string());
        }

        let row = qb.build().fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(evaluate_from_row))
    }

    async fn list_evaluate_jobs(
        &self,
        query: &EvaluateJobQuery,
    ) -> Result<Page<EvaluateJobRecord>> {
        let mut count =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM evaluate WHERE 1 = 1");
        push_evaluate_filters(&mut count, query);
        let total = self.count(count).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM evaluate WHERE 1 = 1");
        push_evaluate_filters(&mut qb, query);
        qb.push(" ORDER BY gmt_created DESC, id DESC");
        push_pagination(&mut qb, query.pagination.as_ref());

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(Page {
            items: rows.iter().map(evaluate_from_row).collect(),
            total,
        })
    }

    async fn delete_evaluate_job(&self, namespace: &str, name: &str, uid: &str) -> Result<()> {
        info!("Deleting evaluate job {}/{}", namespace, name);

        let mut qb =
            QueryBuilder::<Sqlite>::new("UPDATE evaluate SET is_deleted = 1, gmt_modified = ");
        qb.push_bind(Utc::now());
        qb.push(" WHERE namespace = ").push_bind(namespace.to_string());
        qb.push(" AND name = ").push_bind(name.to_string());
        if !uid.is_empty() {
            qb.push(" AND uid = ").push_bind(uid.to_string());
        }
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    // Model catalogue
    async fn write_model(&self, model: ModelRecord) -> Result<i64> {
        debug!("Writing model {}:{}", model.model_name, model.model_version);
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO model (
                model_name, model_version, oss_path, job_id, user_id, gmt_created, gmt_modified
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&model.model_name)
        .bind(&model.model_version)
        .bind(&model.oss_path)
        .bind(&model.job_id)
        .bind(model.user_id.clone().or_else(|| self.user.clone()))
        .bind(model.gmt_created.unwrap_or(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get_model(&self, id: i64) -> Result<Option<ModelRecord>> {
        let row = sqlx::query("SELECT * FROM model WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(model_from_row))
    }

    async fn list_models(&self, query: &ModelQuery) -> Result<Page<ModelRecord>> {
        let mut count =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM model WHERE 1 = 1");
        push_model_filters(&mut count, query);
        let total = self.count(count).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM model WHERE 1 = 1");
        push_model_filters(&mut qb, query);
        qb.push(" ORDER BY id DESC");
        push_pagination(&mut qb, query.pagination.as_ref());

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(Page {
            items: rows.iter().map(model_from_row).collect(),
            total,
        })
    }

    async fn delete_model(&self, id: i64) -> Result<()> {
        info!("Deleting model {}", id);
        let result = sqlx::query("DELETE FROM model WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("model {}", id)));
        }
        Ok(())
    }
}
