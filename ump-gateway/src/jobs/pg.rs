//! Postgres-backed job store.
//!
//! Schema management is external; these queries assume a `jobs` table and a
//! `job_status_history` table with the columns referenced below.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

use ump_common::process::ProcessId;
use ump_common::status::{JobStatus, StatusInfo};

use crate::jobs::store::{Job, JobFilter, JobStore, StatusHistoryEntry, StoreError};

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db_error)?;
        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    process_id: String,
    remote_job_id: Option<String>,
    remote_status_url: Option<String>,
    status: String,
    status_info: Json<StatusInfo>,
    inputs: Json<serde_json::Value>,
    outputs: Option<Json<serde_json::Value>>,
    created: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    updated: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let process_id = ProcessId::parse(&row.process_id)
            .map_err(|error| StoreError::Database(error.to_string()))?;
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|error| StoreError::Database(error.to_string()))?;

        Ok(Job {
            id: row.id,
            process_id,
            remote_job_id: row.remote_job_id,
            remote_status_url: row.remote_status_url,
            status,
            status_info: row.status_info.0,
            inputs: row.inputs.0,
            outputs: row.outputs.map(|outputs| outputs.0),
            created: row.created,
            started: row.started,
            finished: row.finished,
            updated: row.updated,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    job_id: Uuid,
    seq: i64,
    observed_at: DateTime<Utc>,
    snapshot: Json<StatusInfo>,
}

impl From<HistoryRow> for StatusHistoryEntry {
    fn from(row: HistoryRow) -> Self {
        StatusHistoryEntry {
            job_id: row.job_id,
            seq: row.seq,
            observed_at: row.observed_at,
            snapshot: row.snapshot.0,
        }
    }
}

fn db_error(error: sqlx::Error) -> StoreError {
    StoreError::Database(error.to_string())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
INSERT INTO jobs
    (id, process_id, remote_job_id, remote_status_url, status, status_info,
     inputs, outputs, created, started, finished, updated)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.process_id.to_string())
        .bind(&job.remote_job_id)
        .bind(&job.remote_status_url)
        .bind(job.status.to_string())
        .bind(Json(&job.status_info))
        .bind(Json(&job.inputs))
        .bind(job.outputs.as_ref().map(Json))
        .bind(job.created)
        .bind(job.started)
        .bind(job.finished)
        .bind(job.updated)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Conflict(job.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
SELECT id, process_id, remote_job_id, remote_status_url, status, status_info,
       inputs, outputs, created, started, finished, updated
FROM jobs
WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(Job::try_from).transpose()
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        // id, process_id and created are deliberately absent from the SET
        // list; the stored values win.
        let updated = sqlx::query(
            r#"
UPDATE jobs
SET remote_job_id = $2,
    remote_status_url = $3,
    status = $4,
    status_info = $5,
    outputs = $6,
    started = $7,
    finished = $8,
    updated = $9
WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.remote_job_id)
        .bind(&job.remote_status_url)
        .bind(job.status.to_string())
        .bind(Json(&job.status_info))
        .bind(job.outputs.as_ref().map(Json))
        .bind(job.started)
        .bind(job.finished)
        .bind(job.updated)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Missing(job.id));
        }
        Ok(())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
SELECT id, process_id, remote_job_id, remote_status_url, status, status_info,
       inputs, outputs, created, started, finished, updated
FROM jobs
WHERE ($1::text IS NULL OR status = $1)
  AND ($2::text IS NULL OR process_id = $2)
ORDER BY created DESC, id
LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.status.map(|status| status.to_string()))
        .bind(&filter.process_id)
        .bind(filter.limit.map(|limit| limit as i64))
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn append_status(&self, id: Uuid, snapshot: &StatusInfo) -> Result<bool, StoreError> {
        // Single statement so concurrent appends for the same job cannot
        // interleave between the seq read and the insert.
        let appended = sqlx::query(
            r#"
WITH latest AS (
    SELECT seq, snapshot
    FROM job_status_history
    WHERE job_id = $1
    ORDER BY seq DESC
    LIMIT 1
)
INSERT INTO job_status_history (job_id, seq, observed_at, snapshot)
SELECT $1, COALESCE((SELECT seq FROM latest), 0) + 1, NOW(), $2::jsonb
WHERE NOT EXISTS (SELECT 1 FROM latest WHERE snapshot = $2::jsonb)
            "#,
        )
        .bind(id)
        .bind(Json(snapshot))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(appended.rows_affected() > 0)
    }

    async fn history(&self, id: Uuid) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
SELECT job_id, seq, observed_at, snapshot
FROM job_status_history
WHERE job_id = $1
ORDER BY seq
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(StatusHistoryEntry::from).collect())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row: Option<JobRow> = sqlx::query_as(
            r#"
SELECT id, process_id, remote_job_id, remote_status_url, status, status_info,
       inputs, outputs, created, started, finished, updated
FROM jobs
WHERE id = $1
FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        let mut job = Job::try_from(row.ok_or(StoreError::Missing(id))?)?;

        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.finished = Some(now);
        job.updated = now;
        job.status_info.status = JobStatus::Failed;
        job.status_info.message = Some(reason.to_owned());
        job.status_info.finished = Some(now);
        job.status_info.updated = Some(now);

        sqlx::query(
            r#"
UPDATE jobs
SET status = $2, status_info = $3, finished = $4, updated = $5
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(job.status.to_string())
        .bind(Json(&job.status_info))
        .bind(job.finished)
        .bind(job.updated)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(job)
    }
}
