//! Run lifecycle: the single-run guard, manual and timer triggers, and run
//! status queries.

use super::error::SyncError;
use super::reconciler::Reconciler;
use crate::models::{RunTrigger, SyncRun};
use crate::services::RunRepository;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Most recently started run. Left in place after the run ends; the running
/// flag decides whether it is still active.
struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
    handle: Option<JoinHandle<SyncRun>>,
}

/// Clears the running flag when the run ends, however it ends. Also keeps
/// the run counted by the task tracker that [`Scheduler::drain`] waits on.
struct RunningGuard {
    running: Arc<AtomicBool>,
    _tracked: TaskTrackerToken,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    runs: Arc<dyn RunRepository>,
    running: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, runs: Arc<dyn RunRepository>) -> Self {
        Self {
            reconciler,
            runs,
            running: Arc::new(AtomicBool::new(false)),
            active: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the single-run slot and persist a new `running` record.
    async fn begin(&self, trigger: RunTrigger) -> Result<(SyncRun, RunningGuard), SyncError> {
        // Counted before the shutdown check so `drain` cannot miss this run.
        let tracked = self.tracker.token();
        if self.shutdown.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::ConcurrentRun);
        }
        let guard = RunningGuard {
            running: self.running.clone(),
            _tracked: tracked,
        };

        // An earlier run's record left `running` would conflict below.
        self.reconciler
            .record_unrecorded()
            .await
            .map_err(SyncError::StateStore)?;

        let run = SyncRun::start(trigger);
        self.runs.create_run(&run).await.map_err(|e| match e {
            service_core::error::AppError::Conflict(_) => SyncError::ConcurrentRun,
            other => SyncError::StateStore(other),
        })?;

        info!(run_id = %run.run_id, trigger = trigger.as_str(), "Sync run created");
        Ok((run, guard))
    }

    fn active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a run in the background. Fails fast with `ConcurrentRun` when a
    /// run is already active.
    pub async fn trigger_run(&self, trigger: RunTrigger) -> Result<Uuid, SyncError> {
        let (run, guard) = self.begin(trigger).await?;
        let run_id = run.run_id;
        let cancel = self.shutdown.child_token();

        let reconciler = self.reconciler.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let finished = reconciler.run(run, task_cancel).await;
            drop(guard);
            finished
        });

        *self.active() = Some(ActiveRun {
            run_id,
            cancel,
            handle: Some(handle),
        });

        Ok(run_id)
    }

    /// Run to completion on the caller's task.
    pub async fn run_now(&self, trigger: RunTrigger) -> Result<SyncRun, SyncError> {
        let (run, _guard) = self.begin(trigger).await?;
        let run_id = run.run_id;
        let cancel = self.shutdown.child_token();

        *self.active() = Some(ActiveRun {
            run_id,
            cancel: cancel.clone(),
            handle: None,
        });

        Ok(self.reconciler.run(run, cancel).await)
    }

    /// Wait for the most recent background run started by
    /// [`trigger_run`](Self::trigger_run). Returns `None` when it has already
    /// been waited for or the run was started with
    /// [`run_now`](Self::run_now). Use [`drain`](Self::drain) to wait for any
    /// run.
    pub async fn wait_for_active(&self) -> Option<SyncRun> {
        let handle = self.active().as_mut().and_then(|a| a.handle.take())?;
        match handle.await {
            Ok(run) => Some(run),
            Err(e) => {
                error!(error = %e, "Sync run task failed");
                None
            }
        }
    }

    /// Ask the active run to stop. Returns false when nothing is running.
    pub fn cancel_active(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.active().as_ref() {
            Some(active) => {
                info!(run_id = %active.run_id, "Cancelling sync run");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn run_status(&self, run_id: Uuid) -> Result<SyncRun, SyncError> {
        self.runs
            .get_run(run_id)
            .await
            .map_err(SyncError::StateStore)?
            .ok_or(SyncError::RunNotFound(run_id))
    }

    pub async fn latest_run(&self) -> Result<Option<SyncRun>, SyncError> {
        self.runs.latest_run().await.map_err(SyncError::StateStore)
    }

    /// Fire a timer-triggered run every `interval` until shutdown. A tick
    /// that finds a run in progress is skipped.
    pub async fn run_timer(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = interval.as_secs(), "Sync timer started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_now(RunTrigger::Timer).await {
                        Ok(run) => info!(
                            run_id = %run.run_id,
                            status = run.status.as_str(),
                            "Timer run completed"
                        ),
                        Err(SyncError::ConcurrentRun) => {
                            warn!("Skipping timer tick, a sync run is already in progress")
                        }
                        Err(SyncError::ShuttingDown) => break,
                        Err(e) => error!(error = %e, "Timer run could not start"),
                    }
                }
            }
        }

        info!("Sync timer stopped");
    }

    /// Cancel the active run and refuse new ones. Also stops the timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until no run is in progress, whichever trigger started it. Runs
    /// cannot start once this has been called, so call it after
    /// [`shutdown`](Self::shutdown).
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        if let Err(e) = self.reconciler.record_unrecorded().await {
            error!(error = %e, "Run outcomes could not be recorded before exit");
        }
    }
}
