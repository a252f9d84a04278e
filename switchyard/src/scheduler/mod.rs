//! Scheduler: admits work and runs it as jobs on a bounded worker pool.
//!
//! The job table is the source of truth. Timers and recurring loops held in
//! memory are rebuilt from it by [`Scheduler::recover`] after a restart.

mod registry;

pub use registry::OperationRegistry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use device_fanout::FanoutConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::models::{JobDbModel, ScheduleDbModel};
use crate::database::repositories::{
    JobOutcome, JobRepository, LockRepository, ScheduleRepository,
};
use crate::database::time::{duration_to_ms, now_ms, remaining_until};
use crate::domain::{JobRecord, JobStatus, LockKey};
use crate::executor::{JobExecutor, Operation};
use crate::{Error, Result};

/// Message stored on jobs found RUNNING at startup.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by scheduler restart";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of jobs executing at the same time.
    pub max_concurrent_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
        }
    }
}

/// What [`Scheduler::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// QUEUED jobs re-armed for their remaining delay.
    pub requeued: usize,
    /// RUNNING jobs finalized as EXCEPTION.
    pub interrupted: usize,
    /// ABORTING jobs finalized as ABORTED.
    pub aborted: usize,
    /// Recurring schedules re-armed.
    pub schedules: usize,
}

/// The stores the scheduler works against.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobRepository>,
    pub locks: Arc<dyn LockRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
}

/// Front end for submitting, recovering and aborting jobs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    stores: Stores,
    registry: OperationRegistry,
    executor: JobExecutor,
    semaphore: Arc<Semaphore>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    /// Jobs with a timer or execution in flight in this process.
    armed: DashSet<String>,
    /// Cancellation handle per active recurring schedule.
    recurring: DashMap<String, CancellationToken>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        stores: Stores,
        registry: OperationRegistry,
        fanout: FanoutConfig,
    ) -> Self {
        let executor = JobExecutor::new(stores.jobs.clone(), stores.locks.clone(), fanout);
        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            operations = ?registry.names().collect::<Vec<_>>(),
            "Scheduler created"
        );
        Self {
            inner: Arc::new(Inner {
                stores,
                registry,
                executor,
                semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
                cancellation_token: CancellationToken::new(),
                tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
                armed: DashSet::new(),
                recurring: DashMap::new(),
            }),
        }
    }

    pub fn locks(&self) -> &Arc<dyn LockRepository> {
        &self.inner.stores.locks
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    /// Queue one execution of `function_ref` after `delay`. Returns the job id
    /// as soon as the record is stored.
    pub async fn submit_once(
        &self,
        function_ref: &str,
        delay: Duration,
        kwargs: serde_json::Value,
        scheduled_by: &str,
    ) -> Result<String> {
        self.inner
            .enqueue(function_ref, &kwargs, scheduled_by, delay, None)
            .await
    }

    /// Run `function_ref` every `interval`, one job record per firing. Returns
    /// the schedule id.
    pub async fn submit_recurring(
        &self,
        function_ref: &str,
        interval: Duration,
        kwargs: serde_json::Value,
        scheduled_by: &str,
    ) -> Result<String> {
        self.inner.ensure_running()?;
        self.inner.registry.get(function_ref)?;
        check_kwargs(&kwargs)?;
        if duration_to_ms(interval) <= 0 {
            return Err(Error::validation("recurring interval must be at least 1ms"));
        }

        let schedule = ScheduleDbModel::new(function_ref, interval, &kwargs, scheduled_by)?;
        self.inner.stores.schedules.create_schedule(&schedule).await?;
        let schedule_id = schedule.id.clone();
        info!(schedule_id = %schedule_id, function_ref, ?interval, "Recurring job scheduled");
        self.inner.arm_recurring(schedule)?;
        Ok(schedule_id)
    }

    /// Stop future firings of a recurring schedule and delete it.
    pub async fn cancel_recurring(&self, schedule_id: &str) -> Result<()> {
        self.inner.stores.schedules.delete_schedule(schedule_id).await?;
        if let Some((_, token)) = self.inner.recurring.remove(schedule_id) {
            token.cancel();
        }
        info!(schedule_id, "Recurring job cancelled");
        Ok(())
    }

    /// Request cooperative abort of a job through the lock it holds.
    pub async fn abort_job(&self, job_id: &str) -> Result<()> {
        self.inner
            .stores
            .locks
            .request_abort(&LockKey::job(job_id))
            .await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        self.inner.stores.jobs.get_job(job_id).await?.try_into()
    }

    /// Recent jobs, optionally only those in `status`.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<JobRecord>> {
        let jobs = &self.inner.stores.jobs;
        let rows = match status {
            Some(status) => jobs.list_jobs_by_status(status, limit).await?,
            None => jobs.list_recent_jobs(limit).await?,
        };
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    /// Poll until `job_id` reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: &str, timeout: Duration) -> Result<JobRecord> {
        let poll = async {
            loop {
                let job = self.get_job(job_id).await?;
                if job.is_terminal() {
                    return Ok::<_, Error>(job);
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::Other(format!("job {job_id} not finished after {timeout:?}")))?
    }

    /// Rebuild in-memory scheduling state from the stores.
    ///
    /// Safe to call more than once: jobs and schedules already armed in this
    /// process are left alone.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.inner.ensure_running()?;
        let mut report = RecoveryReport::default();

        for job in self.inner.stores.jobs.list_non_terminal_jobs().await? {
            if self.inner.armed.contains(&job.id) {
                continue;
            }
            let status = match job.job_status() {
                Ok(status) => status,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Skipping job during recovery");
                    continue;
                }
            };

            let recovered = match status {
                JobStatus::Queued => {
                    let delay = remaining_until(job.run_at);
                    self.inner
                        .arm(job.id.clone(), &job.function_ref, delay)
                        .map(|_| report.requeued += 1)
                }
                JobStatus::Running => self
                    .inner
                    .finish_interrupted(&job, JobStatus::Exception)
                    .await
                    .map(|_| report.interrupted += 1),
                JobStatus::Aborting => self
                    .inner
                    .finish_interrupted(&job, JobStatus::Aborted)
                    .await
                    .map(|_| report.aborted += 1),
                _ => Ok(()),
            };
            if let Err(e) = recovered {
                warn!(job_id = %job.id, %status, error = %e, "Failed to recover job");
            }
        }

        for schedule in self.inner.stores.schedules.list_schedules().await? {
            if self.inner.recurring.contains_key(&schedule.id) {
                continue;
            }
            let schedule_id = schedule.id.clone();
            match self.inner.arm_recurring(schedule) {
                Ok(()) => report.schedules += 1,
                Err(e) => warn!(%schedule_id, error = %e, "Failed to re-arm recurring job"),
            }
        }

        info!(
            requeued = report.requeued,
            interrupted = report.interrupted,
            aborted = report.aborted,
            schedules = report.schedules,
            "Scheduler recovery complete"
        );
        Ok(report)
    }

    /// Cancel pending timers and recurring loops, then wait for running jobs.
    ///
    /// Jobs whose timer had not fired stay QUEUED and are picked up by the
    /// next [`Scheduler::recover`].
    pub async fn shutdown(&self) {
        info!("Stopping scheduler");
        self.inner.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.inner.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while let Some(joined) = join_set.join_next().await {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    error!(error = %e, "Scheduler task panicked");
                }
            }
        }

        self.inner.recurring.clear();
        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancellation_token.is_cancelled()
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Other("scheduler is shut down".to_string()));
        }
        Ok(())
    }

    fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return false;
        };
        while join_set.try_join_next().is_some() {}
        join_set.spawn(task);
        true
    }

    async fn enqueue(
        self: &Arc<Self>,
        function_ref: &str,
        kwargs: &serde_json::Value,
        scheduled_by: &str,
        delay: Duration,
        schedule_id: Option<&str>,
    ) -> Result<String> {
        self.ensure_running()?;
        self.registry.get(function_ref)?;
        check_kwargs(kwargs)?;

        let run_at = now_ms().saturating_add(duration_to_ms(delay));
        let mut job = JobDbModel::new(function_ref, kwargs, scheduled_by, run_at)?;
        if let Some(schedule_id) = schedule_id {
            job = job.with_schedule(schedule_id);
        }
        self.stores.jobs.create_job(&job).await?;
        info!(job_id = %job.id, function_ref, scheduled_by, ?delay, "Job queued");

        self.arm(job.id.clone(), function_ref, delay)?;
        Ok(job.id)
    }

    /// Start the timer for a QUEUED job. No-op if it is already armed here.
    fn arm(self: &Arc<Self>, job_id: String, function_ref: &str, delay: Duration) -> Result<()> {
        let operation = self.registry.get(function_ref)?;
        if !self.armed.insert(job_id.clone()) {
            debug!(job_id = %job_id, "Job already armed");
            return Ok(());
        }

        let inner = self.clone();
        let key = job_id.clone();
        if !self.spawn(async move { inner.fire(job_id, operation, delay).await }) {
            self.armed.remove(&key);
            return Err(Error::Other("scheduler is shut down".to_string()));
        }
        Ok(())
    }

    async fn fire(&self, job_id: String, operation: Arc<dyn Operation>, delay: Duration) {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => {
                debug!(job_id = %job_id, "Scheduler stopping, job stays queued");
                self.armed.remove(&job_id);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let permit = tokio::select! {
            _ = self.cancellation_token.cancelled() => {
                debug!(job_id = %job_id, "Scheduler stopping, job stays queued");
                self.armed.remove(&job_id);
                return;
            }
            permit = self.semaphore.clone().acquire_owned() => permit,
        };

        if let Ok(_permit) = permit
            && let Err(e) = self.executor.execute(&job_id, operation).await
        {
            error!(job_id = %job_id, error = %e, "Job execution failed");
        }
        self.armed.remove(&job_id);
    }

    fn arm_recurring(self: &Arc<Self>, schedule: ScheduleDbModel) -> Result<()> {
        self.ensure_running()?;
        self.registry.get(&schedule.function_ref)?;
        let kwargs = schedule.kwargs_value()?;

        let token = self.cancellation_token.child_token();
        match self.recurring.entry(schedule.id.clone()) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(token.clone());
            }
        }

        let inner = self.clone();
        let schedule_id = schedule.id.clone();
        if !self.spawn(async move { inner.run_recurring(schedule, kwargs, token).await }) {
            self.recurring.remove(&schedule_id);
            return Err(Error::Other("scheduler is shut down".to_string()));
        }
        Ok(())
    }

    async fn run_recurring(
        self: Arc<Self>,
        schedule: ScheduleDbModel,
        kwargs: serde_json::Value,
        token: CancellationToken,
    ) {
        let period = schedule.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self
                .enqueue(
                    &schedule.function_ref,
                    &kwargs,
                    &schedule.scheduled_by,
                    Duration::ZERO,
                    Some(&schedule.id),
                )
                .await
            {
                Ok(job_id) => debug!(schedule_id = %schedule.id, %job_id, "Recurring job fired"),
                Err(e) => warn!(schedule_id = %schedule.id, error = %e, "Recurring job failed to fire"),
            }
        }
        debug!(schedule_id = %schedule.id, "Recurring loop stopped");
    }

    /// Close out a job left RUNNING or ABORTING by a previous process.
    async fn finish_interrupted(&self, job: &JobDbModel, terminal: JobStatus) -> Result<()> {
        match self.stores.locks.release(&LockKey::job(&job.id)).await {
            Ok(lock) => info!(job_id = %job.id, lock = %lock.name, "Released lock of interrupted job"),
            Err(Error::LockNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let (from, outcome) = match terminal {
            JobStatus::Aborted => (
                JobStatus::Aborting,
                JobOutcome::Result(json!({
                    "aborted": true,
                    "interrupted": true,
                    "finished_devices": job.finished_device_list()?,
                })),
            ),
            _ => (
                JobStatus::Running,
                JobOutcome::Exception(INTERRUPTED_MESSAGE.to_string()),
            ),
        };
        self.stores
            .jobs
            .finalize(&job.id, from, terminal, &outcome)
            .await?;
        info!(job_id = %job.id, status = %terminal, "Finalized interrupted job");
        Ok(())
    }
}

fn check_kwargs(kwargs: &serde_json::Value) -> Result<()> {
    if kwargs.is_object() {
        Ok(())
    } else {
        Err(Error::validation("keyword arguments must be a JSON object"))
    }
}
