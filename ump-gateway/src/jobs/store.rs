//! The job record and the storage port it lives behind.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use ump_common::process::{rel, Link, ProcessId};
use ump_common::status::{JobStatus, StatusInfo};

/// Links every job snapshot carries: its own status route, plus the results
/// route once it finished successfully.
pub fn job_links(api_base: &str, job_id: Uuid, status: JobStatus) -> Vec<Link> {
    let base = api_base.trim_end_matches('/');
    let mut links = vec![Link::json(format!("{base}/jobs/{job_id}"), rel::SELF)];
    if status == JobStatus::Successful {
        links.push(Link::json(
            format!("{base}/jobs/{job_id}/results"),
            rel::RESULTS,
        ));
    }
    links
}

/// A federated job. `id` is minted locally and is the only identifier ever
/// shown on the public surface; the upstream's own id stays internal.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub process_id: ProcessId,
    pub remote_job_id: Option<String>,
    pub remote_status_url: Option<String>,
    pub status: JobStatus,
    pub status_info: StatusInfo,
    /// Opaque copy of the execute request body. Never embedded in
    /// `status_info`.
    pub inputs: serde_json::Value,
    /// Outputs captured when an upstream answered the execute call with the
    /// results document directly.
    pub outputs: Option<serde_json::Value>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
}

impl Job {
    /// A freshly accepted job, not yet forwarded anywhere.
    pub fn new(
        id: Uuid,
        process_id: ProcessId,
        inputs: serde_json::Value,
        api_base: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut status_info =
            StatusInfo::new(process_id.to_string(), id.to_string(), JobStatus::Accepted, now);
        status_info.links = job_links(api_base, id, JobStatus::Accepted);
        status_info.updated = Some(now);

        Self {
            id,
            process_id,
            remote_job_id: None,
            remote_status_url: None,
            status: JobStatus::Accepted,
            status_info,
            inputs,
            outputs: None,
            created: now,
            started: None,
            finished: None,
            updated: now,
        }
    }

    pub fn provider(&self) -> &str {
        self.process_id.provider()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Where the upstream serves this job's results, when it told us enough
    /// to know.
    pub fn remote_results_url(&self, provider: &crate::providers::Provider) -> Option<String> {
        if let Some(url) = &self.remote_status_url {
            return Some(format!("{}/results", url.trim_end_matches('/')));
        }
        self.remote_job_id
            .as_deref()
            .map(|remote_id| provider.url(&format!("jobs/{remote_id}/results")))
    }
}

/// Append-only record of every distinct snapshot a job went through.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusHistoryEntry {
    pub job_id: Uuid,
    pub seq: i64,
    pub observed_at: DateTime<Utc>,
    pub snapshot: StatusInfo,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub process_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Conflict(Uuid),
    #[error("job {0} does not exist")]
    Missing(Uuid),
    #[error("storage failure: {0}")]
    Database(String),
}

/// Storage port for jobs and their status history. Implementations must
/// serialize mutations touching the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Replace the stored record. `id`, `created` and `process_id` are kept
    /// from the stored row no matter what the argument carries.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Append a snapshot with the next `seq`. A snapshot identical to the
    /// latest history entry is not appended; the return value tells whether
    /// anything was written.
    async fn append_status(&self, id: Uuid, snapshot: &StatusInfo) -> Result<bool, StoreError>;

    async fn history(&self, id: Uuid) -> Result<Vec<StatusHistoryEntry>, StoreError>;

    /// Force the job into terminal failure with a human-readable reason.
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<Job, StoreError>;
}

#[derive(Default)]
struct StoredJob {
    job: Option<Job>,
    history: Vec<StatusHistoryEntry>,
}

/// Single-node store used by tests and database-less deployments. One lock
/// over the whole map keeps every mutation serialized.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<HashMap<Uuid, StoredJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.entry(job.id).or_default();
        if slot.job.is_some() {
            return Err(StoreError::Conflict(job.id));
        }
        slot.job = Some(job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.get(&id).and_then(|slot| slot.job.clone()))
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .get_mut(&job.id)
            .and_then(|slot| slot.job.as_mut())
            .ok_or(StoreError::Missing(job.id))?;

        let mut replacement = job.clone();
        replacement.id = stored.id;
        replacement.created = stored.created;
        replacement.process_id = stored.process_id.clone();
        *stored = replacement;
        Ok(())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .values()
            .filter_map(|slot| slot.job.clone())
            .filter(|job| filter.status.map_or(true, |status| job.status == status))
            .filter(|job| {
                filter
                    .process_id
                    .as_deref()
                    .map_or(true, |wanted| job.process_id.to_string() == wanted)
            })
            .collect();
        jobs.sort_by(|a, b| b.created.cmp(&a.created).then(a.id.cmp(&b.id)));

        let jobs = jobs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(jobs)
    }

    async fn append_status(&self, id: Uuid, snapshot: &StatusInfo) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.get_mut(&id).ok_or(StoreError::Missing(id))?;
        if slot.job.is_none() {
            return Err(StoreError::Missing(id));
        }

        if let Some(last) = slot.history.last() {
            if &last.snapshot == snapshot {
                return Ok(false);
            }
        }

        let seq = slot.history.last().map_or(1, |entry| entry.seq + 1);
        slot.history.push(StatusHistoryEntry {
            job_id: id,
            seq,
            observed_at: Utc::now(),
            snapshot: snapshot.clone(),
        });
        Ok(true)
    }

    async fn history(&self, id: Uuid) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.get(&id).map(|slot| slot.history.clone()).unwrap_or_default())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .get_mut(&id)
            .and_then(|slot| slot.job.as_mut())
            .ok_or(StoreError::Missing(id))?;

        let now = Utc::now();
        stored.status = JobStatus::Failed;
        stored.finished = Some(now);
        stored.updated = now;
        stored.status_info.status = JobStatus::Failed;
        stored.status_info.message = Some(reason.to_owned());
        stored.status_info.finished = Some(now);
        stored.status_info.updated = Some(now);
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        Job::new(
            Uuid::now_v7(),
            ProcessId::new("ms1", "square").unwrap(),
            json!({"inputs": {"n": 4}}),
            "http://gateway:5000",
            Utc::now(),
        )
    }

    #[test]
    fn new_jobs_are_accepted_with_a_self_link() {
        let job = job();
        assert_eq!(job.status, JobStatus::Accepted);
        assert!(job.started.is_none());
        assert!(job.finished.is_none());
        assert_eq!(job.status_info.job_id, job.id.to_string());
        assert_eq!(job.status_info.links.len(), 1);
        assert_eq!(job.status_info.links[0].rel, "self");
    }

    #[test]
    fn successful_jobs_link_their_results() {
        let id = Uuid::now_v7();
        let links = job_links("http://gateway:5000/", id, JobStatus::Successful);
        assert_eq!(links.len(), 2);
        assert_eq!(links[1].href, format!("http://gateway:5000/jobs/{id}/results"));
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create(&job).await.unwrap();
        assert!(matches!(
            store.create(&job).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn update_preserves_identity_fields() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create(&job).await.unwrap();

        let mut tampered = job.clone();
        tampered.created = Utc::now();
        tampered.process_id = ProcessId::new("ms9", "other").unwrap();
        tampered.status = JobStatus::Running;
        store.update(&tampered).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.created, job.created);
        assert_eq!(stored.process_id, job.process_id);
        assert_eq!(stored.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn append_status_is_monotonic_and_deduplicated() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create(&job).await.unwrap();

        let first = job.status_info.clone();
        assert!(store.append_status(job.id, &first).await.unwrap());
        // Identical snapshot: history length must not change.
        assert!(!store.append_status(job.id, &first).await.unwrap());

        let mut second = first.clone();
        second.status = JobStatus::Running;
        assert!(store.append_status(job.id, &second).await.unwrap());

        let history = store.history(job.id).await.unwrap();
        let seqs: Vec<i64> = history.iter().map(|entry| entry.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn list_filters_and_pages() {
        let store = MemoryJobStore::new();
        for _ in 0..3 {
            store.create(&job()).await.unwrap();
        }
        let mut running = job();
        running.status = JobStatus::Running;
        running.status_info.status = JobStatus::Running;
        store.create(&running).await.unwrap();

        let all = store.list(&JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let filter = JobFilter {
            status: Some(JobStatus::Accepted),
            ..Default::default()
        };
        assert_eq!(store.list(&filter).await.unwrap().len(), 3);

        let page = JobFilter {
            limit: Some(2),
            offset: 2,
            ..Default::default()
        };
        assert_eq!(store.list(&page).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_failed_is_terminal_with_reason() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create(&job).await.unwrap();

        let failed = store.mark_failed(job.id, "the model server vanished").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.finished.is_some());
        assert_eq!(
            failed.status_info.message.as_deref(),
            Some("the model server vanished")
        );
    }
}
