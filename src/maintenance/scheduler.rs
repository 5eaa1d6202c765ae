/// Bounded maintenance worker pool.
///
/// A fixed number of tokio workers pull [`MaintenanceTask`]s from a bounded
/// queue. `submit` never queues past the bound: when the queue is full the
/// task runs inline on the caller, which caps memory and puts back-pressure
/// on whoever is producing work.
///
/// # Example
///
/// ```ignore
/// let scheduler = MaintenanceScheduler::start(pipeline, SchedulerConfig::default())?;
///
/// match scheduler.submit(MaintenanceTask::new(record_id)).await? {
///     Submission::Accepted(id) => debug!(%id, "Queued"),
///     Submission::ExecutedInline(report) => debug!(?report, "Ran inline"),
/// }
///
/// scheduler.shutdown().await;
/// ```
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pipeline::{MaintenanceTask, Pipeline, TaskId, TaskReport};
use crate::error::{RecallError, RecallResult};

const RECENT_FAILURES: usize = 32;

/// Maintenance configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker tasks
    pub workers: usize,
    /// Queue bound; defaults to the worker count
    pub queue_depth: Option<usize>,
    /// How long shutdown waits for workers before aborting them
    pub shutdown_grace_secs: u64,
    /// Period of the background reconcile pass (0 disables it)
    pub reconcile_interval_secs: u64,
    /// Records examined per reconcile pass
    pub reconcile_batch: usize,
    /// Length cap for extractive summaries
    pub summary_max_chars: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_depth: None,
            shutdown_grace_secs: 10,
            reconcile_interval_secs: 300,
            reconcile_batch: 500,
            summary_max_chars: 280,
        }
    }
}

impl SchedulerConfig {
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(self.workers)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// None when periodic reconciliation is off.
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn validate(&self) -> RecallResult<()> {
        if self.workers == 0 {
            return Err(RecallError::InvalidConfig(
                "maintenance needs at least one worker".into(),
            ));
        }
        if self.queue_depth == Some(0) {
            return Err(RecallError::InvalidConfig(
                "queue_depth must be positive".into(),
            ));
        }
        if self.reconcile_batch == 0 {
            return Err(RecallError::InvalidConfig(
                "reconcile_batch must be positive".into(),
            ));
        }
        if self.summary_max_chars == 0 {
            return Err(RecallError::InvalidConfig(
                "summary_max_chars must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Result of [`MaintenanceScheduler::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Queued for a worker
    Accepted(TaskId),
    /// Queue was full; the task already ran on the caller
    ExecutedInline(TaskReport),
}

impl Submission {
    pub fn task_id(&self) -> TaskId {
        match self {
            Submission::Accepted(id) => *id,
            Submission::ExecutedInline(report) => report.task_id,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Submission::ExecutedInline(_))
    }
}

/// A failed stage, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub record_id: String,
    pub stage: String,
    pub error: String,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub workers: usize,
    pub queue_depth: usize,
    /// Handed to the queue
    pub accepted: u64,
    /// Run on the submitting caller
    pub inline: u64,
    /// Finished by a worker (including failed and cancelled runs)
    pub finished_async: u64,
    /// Tasks with at least one failed stage
    pub failed: u64,
    pub cancelled: u64,
    /// Latest failures, oldest first
    pub recent_failures: Vec<TaskFailure>,
}

#[derive(Debug, Default)]
struct Tally {
    accepted: AtomicU64,
    inline: AtomicU64,
    finished_async: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    recent_failures: Mutex<VecDeque<TaskFailure>>,
    idle: Notify,
}

impl Tally {
    fn observe(&self, report: &TaskReport) {
        if report.cancelled {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        let mut failed = false;
        for (stage, error) in report.failures() {
            failed = true;
            let mut recent = self
                .recent_failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if recent.len() == RECENT_FAILURES {
                recent.pop_front();
            }
            recent.push_back(TaskFailure {
                task_id: report.task_id,
                record_id: report.record_id.clone(),
                stage: stage.to_string(),
                error: error.to_string(),
            });
        }
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn pending(&self) -> u64 {
        self.accepted
            .load(Ordering::Acquire)
            .saturating_sub(self.finished_async.load(Ordering::Acquire))
    }
}

struct Job {
    id: TaskId,
    task: MaintenanceTask,
}

/// What [`MaintenanceScheduler::shutdown`] managed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that exited within the grace period
    pub joined: usize,
    /// Workers aborted after it
    pub aborted: usize,
}

/// Fixed-size async worker pool with inline overflow.
pub struct MaintenanceScheduler {
    pipeline: Arc<Pipeline>,
    config: SchedulerConfig,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: Arc<AtomicBool>,
    next_id: AtomicU64,
    tally: Arc<Tally>,
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("workers", &self.config.workers)
            .field("queue_depth", &self.config.queue_depth())
            .field("pending", &self.tally.pending())
            .finish()
    }
}

impl MaintenanceScheduler {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(pipeline: Arc<Pipeline>, config: SchedulerConfig) -> RecallResult<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::channel::<Job>(config.queue_depth());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = Arc::new(AtomicBool::new(false));
        let tally = Arc::new(Tally::default());

        let workers = (0..config.workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&pipeline),
                    Arc::clone(&cancel),
                    Arc::clone(&tally),
                ))
            })
            .collect();

        info!(
            workers = config.workers,
            queue_depth = config.queue_depth(),
            "Started maintenance scheduler"
        );
        Ok(Self {
            pipeline,
            config,
            queue: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(workers),
            cancel,
            next_id: AtomicU64::new(1),
            tally,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue `task`, or run it right here if the queue is full.
    ///
    /// Fails with `Cancelled` after shutdown.
    pub async fn submit(&self, task: MaintenanceTask) -> RecallResult<Submission> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sender = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(RecallError::Cancelled)?;

        // Count before sending so a fast worker can't finish an uncounted job.
        self.tally.accepted.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(Job { id, task }) {
            Ok(()) => Ok(Submission::Accepted(id)),
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.tally.accepted.fetch_sub(1, Ordering::AcqRel);
                self.tally.idle.notify_waiters();
                self.tally.inline.fetch_add(1, Ordering::Relaxed);
                debug!(task = %id, "Maintenance queue full, running inline");

                let mut report = self.pipeline.run(job.id, job.task, &self.cancel).await;
                report.inline = true;
                self.tally.observe(&report);
                Ok(Submission::ExecutedInline(report))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.tally.accepted.fetch_sub(1, Ordering::AcqRel);
                self.tally.idle.notify_waiters();
                Err(RecallError::Cancelled)
            }
        }
    }

    /// Wait until every accepted task has been finished by a worker.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.tally.idle.notified();
            if self.tally.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let recent_failures = self
            .tally
            .recent_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        SchedulerStats {
            workers: self.config.workers,
            queue_depth: self.config.queue_depth(),
            accepted: self.tally.accepted.load(Ordering::Relaxed),
            inline: self.tally.inline.load(Ordering::Relaxed),
            finished_async: self.tally.finished_async.load(Ordering::Relaxed),
            failed: self.tally.failed.load(Ordering::Relaxed),
            cancelled: self.tally.cancelled.load(Ordering::Relaxed),
            recent_failures,
        }
    }

    /// Stop with the configured grace period.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_within(self.config.shutdown_grace()).await
    }

    /// Close the queue, signal cancellation, and join the workers within
    /// `grace`. Workers still running after that are aborted. Tasks still in
    /// the queue are drained as cancelled.
    pub async fn shutdown_within(&self, grace: Duration) -> ShutdownReport {
        self.cancel.store(true, Ordering::Release);
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let mut handles = std::mem::take(&mut *self.workers.lock().await);
        if handles.is_empty() {
            return ShutdownReport::default();
        }

        let total = handles.len();
        let joined = tokio::time::timeout(grace, futures::future::join_all(handles.iter_mut())).await;
        let report = match joined {
            Ok(_) => ShutdownReport {
                joined: total,
                aborted: 0,
            },
            Err(_) => {
                let mut aborted = 0;
                for handle in &handles {
                    if !handle.is_finished() {
                        handle.abort();
                        aborted += 1;
                    }
                }
                warn!(aborted, "Maintenance workers did not stop in time");
                ShutdownReport {
                    joined: total - aborted,
                    aborted,
                }
            }
        };
        info!(joined = report.joined, aborted = report.aborted, "Maintenance scheduler stopped");
        report
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    pipeline: Arc<Pipeline>,
    cancel: Arc<AtomicBool>,
    tally: Arc<Tally>,
) {
    loop {
        let job = { queue.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        let report = pipeline.run(job.id, job.task, &cancel).await;
        tally.observe(&report);
        tally.finished_async.fetch_add(1, Ordering::AcqRel);
        tally.idle.notify_waiters();
    }
    debug!(worker, "Maintenance worker stopped");
}
