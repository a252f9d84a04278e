//! Per-job handle passed to every operation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use device_fanout::{
    AggregatedResult, DeviceOutcome, DeviceTask, DeviceTaskRunner, FailurePolicy, FanoutError,
    FanoutObserver, FanoutTarget,
};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::database::repositories::{JobRepository, LockRepository};
use crate::domain::{JobStatus, LockKey};
use crate::{Error, Result};

/// Everything an operation may touch while it runs as a job.
///
/// Opened by [`super::JobExecutor`] when the job starts and closed by it when
/// the job is finalized; locks still held at that point are released.
pub struct JobContext {
    job_id: String,
    scheduled_by: String,
    jobs: Arc<dyn JobRepository>,
    locks: Arc<dyn LockRepository>,
    runner: DeviceTaskRunner,
    held: Mutex<Vec<String>>,
    aborting: AtomicBool,
    /// Outcomes per stage per host, kept for the result of an aborted job.
    progress: Mutex<BTreeMap<String, BTreeMap<String, DeviceOutcome>>>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: impl Into<String>,
        scheduled_by: impl Into<String>,
        jobs: Arc<dyn JobRepository>,
        locks: Arc<dyn LockRepository>,
        runner: DeviceTaskRunner,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            scheduled_by: scheduled_by.into(),
            jobs,
            locks,
            runner,
            held: Mutex::new(Vec::new()),
            aborting: AtomicBool::new(false),
            progress: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn scheduled_by(&self) -> &str {
        &self.scheduled_by
    }

    pub fn held_locks(&self) -> Vec<String> {
        self.held.lock().clone()
    }

    /// Take the lock `name` for this job.
    ///
    /// Fails with [`Error::LockConflict`] when another job holds it.
    pub async fn acquire_lock(&self, name: &str) -> Result<()> {
        if let Some(own) = self.held.lock().first() {
            return Err(Error::validation(format!(
                "job {} already holds lock '{}'",
                self.job_id, own
            )));
        }

        if self.locks.acquire(name, &self.job_id).await? {
            info!(job_id = %self.job_id, lock = name, "Acquired job lock");
            self.held.lock().push(name.to_string());
            return Ok(());
        }

        if let Some(existing) = self.locks.get(&LockKey::name(name)).await? {
            return Err(Error::LockConflict {
                name: name.to_string(),
                holder: existing.job_id,
            });
        }
        if let Some(own) = self.locks.get(&LockKey::job(&self.job_id)).await? {
            return Err(Error::validation(format!(
                "job {} already holds lock '{}'",
                self.job_id, own.name
            )));
        }

        // The holder released between our insert and the lookup.
        if self.locks.acquire(name, &self.job_id).await? {
            self.held.lock().push(name.to_string());
            return Ok(());
        }
        Err(Error::LockConflict {
            name: name.to_string(),
            holder: "unknown".to_string(),
        })
    }

    /// Release a lock previously taken with [`Self::acquire_lock`].
    pub async fn release_lock(&self, name: &str) -> Result<()> {
        let position = self.held.lock().iter().position(|held| held == name);
        let Some(position) = position else {
            return Err(Error::LockNotFound(LockKey::name(name).to_string()));
        };

        self.locks.release(&LockKey::job(&self.job_id)).await?;
        self.held.lock().remove(position);
        info!(job_id = %self.job_id, lock = name, "Released job lock");
        Ok(())
    }

    /// Whether abort has been requested on a lock this job holds.
    pub async fn abort_requested(&self) -> Result<bool> {
        if self.held.lock().is_empty() {
            return Ok(false);
        }
        let lock = self.locks.get(&LockKey::job(&self.job_id)).await?;
        Ok(lock.is_some_and(|l| l.abort_requested))
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    /// Abort checkpoint. Returns [`Error::AbortRequested`] once abort has been
    /// observed, after moving the job to ABORTING.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.is_aborting() || self.abort_requested().await? {
            self.enter_aborting().await?;
            return Err(Error::aborted(&self.job_id));
        }
        Ok(())
    }

    pub(crate) async fn enter_aborting(&self) -> Result<()> {
        if self.aborting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(job_id = %self.job_id, "Abort observed, job is unwinding");
        if let Err(e) = self
            .jobs
            .update_status(&self.job_id, JobStatus::Running, JobStatus::Aborting)
            .await
        {
            self.aborting.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Fan `task` out over `targets` as stage `stage`.
    ///
    /// The abort flag is checked before the stage and before every device.
    /// A fail-fast stage with failures becomes [`Error::PartialDeviceFailure`];
    /// a stopped stage becomes [`Error::AbortRequested`].
    pub async fn fanout<T: FanoutTarget>(
        &self,
        stage: &str,
        targets: Vec<T>,
        task: Arc<dyn DeviceTask<T>>,
        policy: FailurePolicy,
    ) -> Result<AggregatedResult> {
        self.checkpoint().await?;
        match self.runner.run(stage, targets, task, policy, self).await {
            Ok(result) => Ok(result),
            Err(FanoutError::Stopped { .. }) => Err(Error::aborted(&self.job_id)),
            Err(FanoutError::FailFast { stage, result }) => Err(Error::PartialDeviceFailure {
                stage,
                failures: result
                    .outcomes()
                    .iter()
                    .filter_map(|(host, outcome)| match outcome {
                        DeviceOutcome::Failed { message } => Some((host.clone(), message.clone())),
                        DeviceOutcome::Succeeded { .. } => None,
                    })
                    .collect(),
            }),
        }
    }

    /// Per-device outcomes recorded so far, grouped by stage.
    pub fn partial_result(&self) -> serde_json::Value {
        let progress = self.progress.lock();
        json!({
            "aborted": true,
            "stages": &*progress,
        })
    }

    /// Release every lock this job still holds in the store.
    pub(crate) async fn close(&self) {
        let leftover = std::mem::take(&mut *self.held.lock());
        match self.locks.release(&LockKey::job(&self.job_id)).await {
            Ok(lock) => {
                info!(job_id = %self.job_id, lock = %lock.name, "Released lock left by job")
            }
            Err(Error::LockNotFound(_)) => {
                if !leftover.is_empty() {
                    warn!(job_id = %self.job_id, ?leftover, "Held lock vanished before release");
                }
            }
            Err(e) => warn!(job_id = %self.job_id, error = %e, "Failed to release job lock"),
        }
    }
}

#[async_trait]
impl FanoutObserver for JobContext {
    async fn should_stop(&self) -> bool {
        match self.checkpoint().await {
            Ok(()) => false,
            Err(e) if e.is_abort() => true,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Abort check failed, continuing");
                false
            }
        }
    }

    async fn device_finished(&self, stage: &str, hostname: &str, outcome: &DeviceOutcome) {
        self.progress
            .lock()
            .entry(stage.to_string())
            .or_default()
            .insert(hostname.to_string(), outcome.clone());

        if let Err(e) = self.jobs.append_finished_device(&self.job_id, hostname).await {
            warn!(job_id = %self.job_id, host = hostname, error = %e, "Failed to record device progress");
        } else {
            debug!(job_id = %self.job_id, stage, host = hostname, "Device finished");
        }
    }
}
