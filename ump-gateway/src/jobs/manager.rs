//! The job lifecycle coordinator: creates local jobs, forwards execution
//! requests upstream, applies derived snapshots under the state machine's
//! rules and drives the background polling of running jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use ump_common::client::HttpClient;
use ump_common::retry::RetryPolicy;
use ump_common::status::{JobStatus, StatusInfo};

use crate::api::GatewayError;
use crate::jobs::derive::{DeriveContext, Derived, StatusDeriver};
use crate::jobs::observer::{
    JobObserver, ObserverBus, PollingSchedulerObserver, ResultsVerificationObserver,
    StatusHistoryObserver,
};
use crate::jobs::poller::{run_scheduler, PollCommand, SchedulerHeartbeat, SchedulerSettings};
use crate::jobs::store::{job_links, Job, JobFilter, JobStore, StoreError};
use crate::processes::ProcessManager;
use crate::providers::{ProvidersRegistry, ResultStorage};

#[derive(Clone)]
pub struct JobManagerSettings {
    pub api_base: String,
    pub forward_retry: RetryPolicy,
    pub poll_retry: RetryPolicy,
    pub poll_interval: Duration,
    pub poll_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub results_verify_downgrade: bool,
}

impl Default for JobManagerSettings {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:5000".to_owned(),
            forward_retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(5))
                .expect("default forward retry policy is valid"),
            poll_retry: RetryPolicy::single_attempt(),
            poll_interval: Duration::from_secs(5),
            poll_timeout: None,
            shutdown_grace: Duration::from_secs(5),
            results_verify_downgrade: false,
        }
    }
}

/// What the poll loop should do after one poll round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Continue,
    Stop,
}

/// How the results route should answer for a finished job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResults {
    Inline(Value),
    Redirect(String),
}

pub struct JobManager {
    store: Arc<dyn JobStore>,
    client: Arc<dyn HttpClient>,
    registry: Arc<ProvidersRegistry>,
    processes: Arc<ProcessManager>,
    deriver: StatusDeriver,
    bus: ObserverBus,
    settings: JobManagerSettings,
    shutdown_tx: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    heartbeat: SchedulerHeartbeat,
    shutting_down: AtomicBool,
}

impl JobManager {
    /// Wire up the manager with its built-in observers and start the poll
    /// scheduler. Extra observers run after the built-in ones, in order.
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn HttpClient>,
        registry: Arc<ProvidersRegistry>,
        processes: Arc<ProcessManager>,
        settings: JobManagerSettings,
        extra_observers: Vec<Arc<dyn JobObserver>>,
    ) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::channel::<PollCommand>(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let heartbeat = SchedulerHeartbeat::new();

        let mut observers: Vec<Arc<dyn JobObserver>> = vec![
            Arc::new(StatusHistoryObserver::new(store.clone())),
            Arc::new(PollingSchedulerObserver::new(commands_tx)),
            Arc::new(ResultsVerificationObserver::new(
                client.clone(),
                store.clone(),
                registry.clone(),
                settings.results_verify_downgrade,
            )),
        ];
        observers.extend(extra_observers);

        let scheduler_settings = SchedulerSettings {
            interval: settings.poll_interval,
            shutdown_grace: settings.shutdown_grace,
        };

        let manager = Arc::new(Self {
            store,
            client,
            registry,
            processes,
            deriver: StatusDeriver::default(),
            bus: ObserverBus::new(observers),
            settings,
            shutdown_tx,
            scheduler: Mutex::new(None),
            heartbeat: heartbeat.clone(),
            shutting_down: AtomicBool::new(false),
        });

        let scheduler = tokio::spawn(run_scheduler(
            Arc::downgrade(&manager),
            commands_rx,
            shutdown_rx,
            scheduler_settings,
            heartbeat,
        ));
        *manager.scheduler.lock().expect("poisoned scheduler handle lock") = Some(scheduler);

        manager
    }

    /// Liveness of the scheduler loop, for the process probe route.
    pub fn heartbeat(&self) -> SchedulerHeartbeat {
        self.heartbeat.clone()
    }

    /// Execute a process: persist a local job, forward the request with the
    /// retry policy, and fold the upstream answer into the job. The job is
    /// always created; a failed forward shows up as a failed snapshot, not
    /// as an HTTP error.
    pub async fn create_and_forward(
        &self,
        process_ref: &str,
        body: Value,
    ) -> Result<Job, GatewayError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        if !body.is_object() {
            return Err(GatewayError::InvalidInput(
                "execute request body must be a JSON object".to_owned(),
            ));
        }

        // Resolve before touching storage; unknown processes are a plain 404.
        let descriptor = self.processes.get(process_ref).await?;
        let process_id = descriptor
            .summary
            .process_id()
            .map_err(|error| GatewayError::Internal(error.to_string()))?;
        let provider = self
            .registry
            .resolve(&process_id)
            .ok_or_else(|| GatewayError::NotFound(process_id.to_string()))?;

        let job = Job::new(
            Uuid::now_v7(),
            process_id.clone(),
            body.clone(),
            &self.settings.api_base,
            Utc::now(),
        );
        self.store.create(&job).await.map_err(into_internal)?;
        metrics::counter!("gateway_jobs_created_total").increment(1);
        self.bus.job_created(&job, &job.status_info).await;

        let url = provider.url(&format!("processes/{}/execution", process_id.bare()));
        let headers = provider.headers();
        let forwarded = self
            .settings
            .forward_retry
            .run(|| self.client.post(&url, &body, provider.timeout, &headers))
            .await;

        match forwarded {
            Ok(response) => {
                let derived = self
                    .deriver
                    .derive(&DeriveContext {
                        response: &response,
                        provider: &provider,
                        job: &job,
                        client: self.client.as_ref(),
                        api_base: &self.settings.api_base,
                    })
                    .await;
                self.apply(job, derived, false).await
            }
            Err(error) => {
                metrics::counter!("gateway_forward_failures_total").increment(1);
                self.fail(job, format!("failed to forward execution request: {error}"))
                    .await
            }
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, GatewayError> {
        self.store
            .get(job_id)
            .await
            .map_err(into_internal)?
            .ok_or_else(|| GatewayError::NotFound(job_id.to_string()))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, GatewayError> {
        self.store.list(filter).await.map_err(into_internal)
    }

    /// Dismiss a non-terminal job: cancel upstream best-effort, record the
    /// terminal snapshot, let the observers stop the poll task.
    pub async fn dismiss(&self, job_id: Uuid) -> Result<Job, GatewayError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        let job = self.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(GatewayError::InvalidInput(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }

        if let (Some(provider), Some(url)) =
            (self.registry.get(job.provider()), job.remote_status_url.clone())
        {
            if let Err(error) = self
                .client
                .delete(&url, provider.timeout, &provider.headers())
                .await
            {
                // Local state is authoritative; an unreachable upstream does
                // not block dismissal.
                warn!(%job_id, %error, "upstream dismissal failed");
            }
        }

        let mut info = StatusInfo::new(
            job.process_id.to_string(),
            job.id.to_string(),
            JobStatus::Dismissed,
            job.created,
        )
        .with_message("job dismissed on request");
        info.links = job_links(&self.settings.api_base, job.id, JobStatus::Dismissed);

        self.apply(
            job,
            Derived {
                status_info: info,
                remote_job_id: None,
                remote_status_url: None,
                outputs: None,
            },
            false,
        )
        .await
    }

    /// Resolve the results of a successfully finished job.
    pub async fn results(&self, job_id: Uuid) -> Result<JobResults, GatewayError> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Successful {
            return Err(GatewayError::ResultsNotReady(job_id));
        }
        if let Some(outputs) = job.outputs.clone() {
            return Ok(JobResults::Inline(outputs));
        }

        let provider = self.registry.get(job.provider()).ok_or_else(|| {
            GatewayError::Internal(format!("provider {} is no longer configured", job.provider()))
        })?;
        let url = job.remote_results_url(&provider).ok_or_else(|| {
            GatewayError::Internal(format!("job {job_id} finished without a results location"))
        })?;

        match provider.policy(job.process_id.bare()).result_storage {
            ResultStorage::Remote => Ok(JobResults::Redirect(url)),
            ResultStorage::Local => {
                let response = self
                    .client
                    .get(&url, provider.timeout, &provider.headers())
                    .await
                    .map_err(|error| GatewayError::Upstream(error.to_string()))?;
                if !response.is_success() {
                    return Err(GatewayError::Upstream(format!(
                        "{url} answered {}",
                        response.status
                    )));
                }
                let body = response
                    .require_json(&url)
                    .map_err(|error| GatewayError::Upstream(error.to_string()))?;
                Ok(JobResults::Inline(body))
            }
        }
    }

    /// One poll round for one job, driven by its background loop. Poll
    /// failures never fail the job; only recognizable terminal snapshots or
    /// the runtime deadline do.
    pub(crate) async fn poll_once(&self, job_id: Uuid) -> PollOutcome {
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return PollOutcome::Stop,
            Err(error) => {
                warn!(%job_id, %error, "failed to load job for polling");
                return PollOutcome::Continue;
            }
        };
        if job.status.is_terminal() {
            return PollOutcome::Stop;
        }
        let Some(status_url) = job.remote_status_url.clone() else {
            return PollOutcome::Stop;
        };

        if let Some(limit) = self.settings.poll_timeout {
            let age = (Utc::now() - job.created).to_std().unwrap_or_default();
            if age > limit {
                return self.force_timeout(job).await;
            }
        }

        let provider = match self.registry.get(job.provider()) {
            Some(provider) => provider,
            None => {
                warn!(%job_id, provider = job.provider(), "provider vanished from configuration");
                return PollOutcome::Stop;
            }
        };

        metrics::counter!("gateway_poll_ticks_total").increment(1);
        let headers = provider.headers();
        let polled = self
            .settings
            .poll_retry
            .run(|| self.client.get(&status_url, provider.timeout, &headers))
            .await;
        let response = match polled {
            Ok(response) => response,
            Err(error) => {
                warn!(%job_id, %error, "status poll failed, will retry");
                return PollOutcome::Continue;
            }
        };

        let ctx = DeriveContext {
            response: &response,
            provider: &provider,
            job: &job,
            client: self.client.as_ref(),
            api_base: &self.settings.api_base,
        };
        let Some(derived) = self.deriver.derive_lenient(&ctx).await else {
            warn!(%job_id, status = %response.status, "unrecognizable status answer, will retry");
            return PollOutcome::Continue;
        };

        match self.apply(job, derived, true).await {
            Ok(job) if job.status.is_terminal() => PollOutcome::Stop,
            Ok(_) => PollOutcome::Continue,
            Err(error) => {
                warn!(%job_id, %error, "failed to apply polled snapshot");
                PollOutcome::Continue
            }
        }
    }

    /// Fold a derived snapshot into the job. Terminal jobs never move;
    /// with `dedupe` set, a snapshot identical to the current one only
    /// refreshes the `updated` stamp and fires nothing.
    async fn apply(
        &self,
        job: Job,
        derived: Derived,
        dedupe: bool,
    ) -> Result<Job, GatewayError> {
        if job.status.is_terminal() {
            warn!(
                job_id = %job.id,
                current = %job.status,
                claimed = %derived.status_info.status,
                "ignoring snapshot claiming a transition out of a terminal state"
            );
            return Ok(job);
        }

        let now = Utc::now();
        let status = derived.status_info.status;
        let mut info = derived.status_info;
        info.started = job
            .started
            .or_else(|| (status != JobStatus::Accepted).then_some(now));
        info.finished = status.is_terminal().then_some(now);

        let mut next = job.clone();
        next.remote_job_id = derived.remote_job_id.or(next.remote_job_id);
        next.remote_status_url = derived.remote_status_url.or(next.remote_status_url);
        if derived.outputs.is_some() {
            next.outputs = derived.outputs;
        }

        if dedupe && info.same_observation(&job.status_info) {
            next.updated = now;
            next.status_info.updated = Some(now);
            self.store.update(&next).await.map_err(into_internal)?;
            return Ok(next);
        }

        info.updated = Some(now);
        next.status = status;
        next.started = info.started;
        next.finished = info.finished;
        next.updated = now;
        next.status_info = info;
        self.store.update(&next).await.map_err(into_internal)?;

        let old = job.status_info;
        self.bus.status_changed(&next, &old, &next.status_info).await;
        if status.is_terminal() {
            metrics::counter!(
                "gateway_jobs_finished_total",
                &[("status", status.to_string())]
            )
            .increment(1);
            self.bus.job_completed(&next, &next.status_info).await;
        }
        Ok(next)
    }

    /// Terminal failure with a diagnostic, through the normal transition
    /// path so history and observers see it.
    async fn fail(&self, job: Job, message: String) -> Result<Job, GatewayError> {
        let mut info = StatusInfo::new(
            job.process_id.to_string(),
            job.id.to_string(),
            JobStatus::Failed,
            job.created,
        )
        .with_message(message);
        info.links = job_links(&self.settings.api_base, job.id, JobStatus::Failed);

        self.apply(
            job,
            Derived {
                status_info: info,
                remote_job_id: None,
                remote_status_url: None,
                outputs: None,
            },
            false,
        )
        .await
    }

    async fn force_timeout(&self, job: Job) -> PollOutcome {
        warn!(job_id = %job.id, "job exceeded its maximum runtime, forcing failure");
        let old = job.status_info.clone();
        match self
            .store
            .mark_failed(job.id, "job exceeded its maximum runtime and was abandoned")
            .await
        {
            Ok(failed) => {
                self.bus
                    .status_changed(&failed, &old, &failed.status_info)
                    .await;
                self.bus.job_completed(&failed, &failed.status_info).await;
                PollOutcome::Stop
            }
            Err(error) => {
                warn!(job_id = %job.id, %error, "failed to persist the timeout failure");
                PollOutcome::Stop
            }
        }
    }

    /// Stop accepting work, stop every poll task and wait for them within
    /// the grace budget. In-flight calls finish on their own.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("job manager shutting down");
        let _ = self.shutdown_tx.send(true);

        let scheduler = self
            .scheduler
            .lock()
            .expect("poisoned scheduler handle lock")
            .take();
        if let Some(scheduler) = scheduler {
            let budget = self.settings.shutdown_grace + Duration::from_secs(1);
            if tokio::time::timeout(budget, scheduler).await.is_err() {
                warn!("poll scheduler did not stop within the shutdown budget");
            }
        }
    }
}

fn into_internal(error: StoreError) -> GatewayError {
    GatewayError::Internal(error.to_string())
}
