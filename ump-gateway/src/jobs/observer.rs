//! Lifecycle event fan-out. Observers are independent: one failing or
//! misbehaving observer is logged and skipped, the others always run.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use ump_common::client::HttpClient;
use ump_common::status::{JobStatus, StatusInfo};

use crate::jobs::poller::PollCommand;
use crate::jobs::store::{Job, JobStore};
use crate::providers::{ProvidersRegistry, ResultStorage};

/// A subscriber to job lifecycle events. Implement only the hooks you care
/// about; the defaults do nothing.
#[async_trait]
pub trait JobObserver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_job_created(&self, _job: &Job, _snapshot: &StatusInfo) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_status_changed(
        &self,
        _job: &Job,
        _old: &StatusInfo,
        _new: &StatusInfo,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_job_completed(&self, _job: &Job, _snapshot: &StatusInfo) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Invokes observers sequentially in registration order; failures are
/// logged and swallowed, never propagated to the job lifecycle.
pub struct ObserverBus {
    observers: Vec<Arc<dyn JobObserver>>,
}

impl ObserverBus {
    pub fn new(observers: Vec<Arc<dyn JobObserver>>) -> Self {
        Self { observers }
    }

    pub async fn job_created(&self, job: &Job, snapshot: &StatusInfo) {
        for observer in &self.observers {
            if let Err(cause) = observer.on_job_created(job, snapshot).await {
                report(observer.name(), job.id, "on_job_created", cause);
            }
        }
    }

    pub async fn status_changed(&self, job: &Job, old: &StatusInfo, new: &StatusInfo) {
        for observer in &self.observers {
            if let Err(cause) = observer.on_status_changed(job, old, new).await {
                report(observer.name(), job.id, "on_status_changed", cause);
            }
        }
    }

    pub async fn job_completed(&self, job: &Job, snapshot: &StatusInfo) {
        for observer in &self.observers {
            if let Err(cause) = observer.on_job_completed(job, snapshot).await {
                report(observer.name(), job.id, "on_job_completed", cause);
            }
        }
    }
}

fn report(observer: &str, job_id: Uuid, hook: &str, cause: anyhow::Error) {
    metrics::counter!("gateway_observer_failures_total", &[("observer", observer.to_owned())])
        .increment(1);
    error!(observer, %job_id, hook, %cause, "job observer failed");
}

/// Writes every fresh snapshot to the append-only history. Completion is
/// not a separate entry; the terminal status change already covers it.
pub struct StatusHistoryObserver {
    store: Arc<dyn JobStore>,
}

impl StatusHistoryObserver {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobObserver for StatusHistoryObserver {
    fn name(&self) -> &'static str {
        "status-history"
    }

    async fn on_job_created(&self, job: &Job, snapshot: &StatusInfo) -> anyhow::Result<()> {
        self.store.append_status(job.id, snapshot).await?;
        Ok(())
    }

    async fn on_status_changed(
        &self,
        job: &Job,
        _old: &StatusInfo,
        new: &StatusInfo,
    ) -> anyhow::Result<()> {
        self.store.append_status(job.id, new).await?;
        Ok(())
    }
}

/// Keeps the poll scheduler in sync with job state: non-terminal jobs with
/// a remote status endpoint get a poll task, terminal jobs lose theirs.
pub struct PollingSchedulerObserver {
    commands: mpsc::Sender<PollCommand>,
}

impl PollingSchedulerObserver {
    pub fn new(commands: mpsc::Sender<PollCommand>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl JobObserver for PollingSchedulerObserver {
    fn name(&self) -> &'static str {
        "polling-scheduler"
    }

    async fn on_status_changed(
        &self,
        job: &Job,
        _old: &StatusInfo,
        new: &StatusInfo,
    ) -> anyhow::Result<()> {
        let command = if new.status.is_terminal() {
            PollCommand::Cancel(job.id)
        } else if job.remote_status_url.is_some() {
            PollCommand::Schedule(job.id)
        } else {
            return Ok(());
        };
        self.commands.send(command).await?;
        Ok(())
    }
}

/// After a successful completion with remotely stored results, probe the
/// upstream results endpoint once. A broken endpoint is a warning by
/// default; with the downgrade flag set, the job is failed outright.
pub struct ResultsVerificationObserver {
    client: Arc<dyn HttpClient>,
    store: Arc<dyn JobStore>,
    registry: Arc<ProvidersRegistry>,
    downgrade: bool,
}

impl ResultsVerificationObserver {
    pub fn new(
        client: Arc<dyn HttpClient>,
        store: Arc<dyn JobStore>,
        registry: Arc<ProvidersRegistry>,
        downgrade: bool,
    ) -> Self {
        Self {
            client,
            store,
            registry,
            downgrade,
        }
    }
}

#[async_trait]
impl JobObserver for ResultsVerificationObserver {
    fn name(&self) -> &'static str {
        "results-verification"
    }

    async fn on_job_completed(&self, job: &Job, snapshot: &StatusInfo) -> anyhow::Result<()> {
        if snapshot.status != JobStatus::Successful {
            return Ok(());
        }
        // Locally captured outputs need no remote probe.
        if job.outputs.is_some() {
            return Ok(());
        }
        let provider = self.registry.get(job.provider());
        if provider
            .as_ref()
            .map(|p| p.policy(job.process_id.bare()).result_storage)
            != Some(ResultStorage::Remote)
        {
            return Ok(());
        }
        let Some(provider) = provider else {
            return Ok(());
        };
        let Some(url) = job.remote_results_url(&provider) else {
            return Ok(());
        };

        let probe = self
            .client
            .head(&url, provider.timeout, &provider.headers())
            .await;
        let healthy = matches!(&probe, Ok(response) if response.is_success());
        if healthy {
            return Ok(());
        }

        warn!(job_id = %job.id, url, "results endpoint probe failed after completion");
        if self.downgrade {
            // Writes through the store on purpose: re-entering the bus here
            // would fire completion events recursively.
            self.store
                .mark_failed(job.id, "job completed but its results endpoint is unreachable")
                .await?;
        }
        Ok(())
    }
}
