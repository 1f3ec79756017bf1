//! Background polling of remote status endpoints.
//!
//! A single scheduler task owns every poll task. It is the only mutator of
//! the task map, which is what guarantees at most one live poll task per
//! job id. Cancellation is cooperative: a cancelled loop finishes whatever
//! transition it is in the middle of and exits at its next suspension
//! point, so observers are never cut off halfway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jobs::manager::{JobManager, PollOutcome};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
// Four missed beats: the loop is wedged, not merely busy.
const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Liveness signal of the scheduler loop, the one long-lived task of the
/// engine. The loop stamps it on every heartbeat tick; the `/_liveness`
/// probe reads the age of the last stamp and fails the process once the
/// loop has gone quiet for too long.
#[derive(Clone)]
pub struct SchedulerHeartbeat {
    stale_after: Duration,
    last_beat_ms: Arc<AtomicI64>,
}

impl SchedulerHeartbeat {
    pub(crate) fn new() -> Self {
        Self::with_threshold(HEARTBEAT_STALE_AFTER)
    }

    fn with_threshold(stale_after: Duration) -> Self {
        // A fresh heartbeat counts as beaten, so startup never probes dead.
        Self {
            stale_after,
            last_beat_ms: Arc::new(AtomicI64::new(Self::now_ms())),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub(crate) fn beat(&self) {
        self.last_beat_ms.store(Self::now_ms(), Ordering::Relaxed);
    }

    /// Time since the scheduler last reported in.
    pub fn age(&self) -> Duration {
        let elapsed = Self::now_ms().saturating_sub(self.last_beat_ms.load(Ordering::Relaxed));
        Duration::from_millis(elapsed.max(0) as u64)
    }

    pub fn is_alive(&self) -> bool {
        self.age() <= self.stale_after
    }
}

#[derive(Debug)]
pub enum PollCommand {
    Schedule(Uuid),
    Cancel(Uuid),
}

struct PollTask {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

pub(crate) struct SchedulerSettings {
    pub interval: Duration,
    pub shutdown_grace: Duration,
}

pub(crate) async fn run_scheduler(
    manager: Weak<JobManager>,
    mut commands: mpsc::Receiver<PollCommand>,
    mut shutdown: watch::Receiver<bool>,
    settings: SchedulerSettings,
    heartbeat: SchedulerHeartbeat,
) {
    let mut tasks: HashMap<Uuid, PollTask> = HashMap::new();
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                heartbeat.beat();
                tasks.retain(|_, task| !task.handle.is_finished());
                metrics::gauge!("gateway_poll_tasks_live").set(tasks.len() as f64);
                continue;
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                tasks.retain(|_, task| !task.handle.is_finished());

                match command {
                    PollCommand::Schedule(job_id) => {
                        if tasks.contains_key(&job_id) {
                            debug!(%job_id, "poll task already live");
                            continue;
                        }
                        let (cancel_tx, cancel_rx) = watch::channel(false);
                        let handle = tokio::spawn(poll_loop(
                            manager.clone(),
                            job_id,
                            settings.interval,
                            shutdown.clone(),
                            cancel_rx,
                        ));
                        tasks.insert(
                            job_id,
                            PollTask {
                                handle,
                                cancel: cancel_tx,
                            },
                        );
                        metrics::gauge!("gateway_poll_tasks_live").set(tasks.len() as f64);
                    }
                    PollCommand::Cancel(job_id) => {
                        if let Some(task) = tasks.get(&job_id) {
                            // Idempotent: repeated sends are harmless.
                            let _ = task.cancel.send(true);
                        }
                    }
                }
            }
        }
    }

    // Drain: the shared shutdown signal stops every loop at its next
    // suspension point; anything still running past the grace deadline is
    // aborted.
    info!(live = tasks.len(), "stopping poll tasks");
    let mut handles = Vec::with_capacity(tasks.len());
    for (_, task) in tasks.drain() {
        let _ = task.cancel.send(true);
        handles.push(task.handle);
    }
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    let drained = tokio::time::timeout(
        settings.shutdown_grace,
        futures::future::join_all(handles),
    )
    .await;
    if drained.is_err() {
        warn!("poll tasks exceeded the shutdown grace period, aborting them");
        for abort in aborts {
            abort.abort();
        }
    }
}

async fn poll_loop(
    manager: Weak<JobManager>,
    job_id: Uuid,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = cancel.changed() => return,
            _ = ticker.tick() => {}
        }

        // The engine going away ends the loop; a lingering task must not
        // keep it alive.
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match manager.poll_once(job_id).await {
            PollOutcome::Continue => {}
            PollOutcome::Stop => {
                debug!(%job_id, "poll loop finished");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heartbeat_is_alive() {
        let heartbeat = SchedulerHeartbeat::with_threshold(Duration::from_secs(60));
        assert!(heartbeat.is_alive());
        assert!(heartbeat.age() < Duration::from_secs(1));
    }

    #[test]
    fn heartbeat_goes_stale_and_recovers_on_beat() {
        let heartbeat = SchedulerHeartbeat::with_threshold(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!heartbeat.is_alive());

        heartbeat.beat();
        assert!(heartbeat.is_alive());
    }

    #[test]
    fn clones_share_the_same_pulse() {
        let heartbeat = SchedulerHeartbeat::with_threshold(Duration::from_millis(10));
        let probe = heartbeat.clone();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!probe.is_alive());

        heartbeat.beat();
        assert!(probe.is_alive());
    }
}
