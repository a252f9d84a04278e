//! Turns an operation into a tracked job.
//!
//! [`JobExecutor::execute`] owns the whole lifecycle of one job record:
//! QUEUED -> RUNNING, the operation call, and exactly one terminal write,
//! followed by releasing whatever lock the job still holds.

mod context;

pub use context::JobContext;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use device_fanout::{DeviceTaskRunner, FanoutConfig};
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::database::repositories::{JobOutcome, JobRepository, LockRepository};
use crate::domain::JobStatus;
use crate::Result;

/// A named unit of work that can be scheduled as a job.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Reference stored in the job record.
    fn name(&self) -> &'static str;

    /// Run with the job's start arguments. The returned value becomes the job result.
    async fn run(&self, ctx: &JobContext, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// Executes operations against persisted job records.
pub struct JobExecutor {
    jobs: Arc<dyn JobRepository>,
    locks: Arc<dyn LockRepository>,
    runner: DeviceTaskRunner,
}

impl JobExecutor {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        locks: Arc<dyn LockRepository>,
        fanout: FanoutConfig,
    ) -> Self {
        Self {
            jobs,
            locks,
            runner: DeviceTaskRunner::new(fanout),
        }
    }

    /// Run `operation` for the QUEUED job `job_id` and return its terminal status.
    ///
    /// Errors only when the record cannot be loaded, was not QUEUED, or the
    /// store fails while writing status. Operation failures end up in the record.
    pub async fn execute(&self, job_id: &str, operation: Arc<dyn Operation>) -> Result<JobStatus> {
        let job = self.jobs.get_job(job_id).await?;
        let args: serde_json::Value = serde_json::from_str(&job.start_arguments)?;

        self.jobs.mark_running(job_id).await?;
        info!(job_id, operation = operation.name(), scheduled_by = %job.scheduled_by, "Job started");

        let ctx = JobContext::new(
            job_id,
            job.scheduled_by,
            self.jobs.clone(),
            self.locks.clone(),
            self.runner.clone(),
        );

        let outcome = AssertUnwindSafe(operation.run(&ctx, args))
            .catch_unwind()
            .await;

        let finalized = self.finalize(&ctx, outcome).await;
        ctx.close().await;

        match &finalized {
            Ok(status) => info!(job_id, %status, "Job finished"),
            Err(e) => error!(job_id, error = %e, "Failed to record job outcome"),
        }
        finalized
    }

    async fn finalize(
        &self,
        ctx: &JobContext,
        outcome: std::thread::Result<Result<serde_json::Value>>,
    ) -> Result<JobStatus> {
        let job_id = ctx.job_id();
        let abort_observed = matches!(&outcome, Ok(Err(e)) if e.is_abort());

        if ctx.is_aborting() || abort_observed {
            if let Ok(Err(e)) = &outcome
                && !e.is_abort()
            {
                warn!(job_id, error = %e, "Operation failed while aborting");
            }
            ctx.enter_aborting().await?;
            self.jobs
                .finalize(
                    job_id,
                    JobStatus::Aborting,
                    JobStatus::Aborted,
                    &JobOutcome::Result(ctx.partial_result()),
                )
                .await?;
            return Ok(JobStatus::Aborted);
        }

        let (status, payload) = match outcome {
            Ok(Ok(value)) => (JobStatus::Finished, JobOutcome::Result(value)),
            Ok(Err(e)) => {
                warn!(job_id, error = %e, "Operation failed");
                (JobStatus::Exception, JobOutcome::Exception(e.to_string()))
            }
            Err(panic) => {
                let message = format!("operation panicked: {}", panic_message(panic.as_ref()));
                error!(job_id, "{}", message);
                (JobStatus::Exception, JobOutcome::Exception(message))
            }
        };

        self.jobs
            .finalize(job_id, JobStatus::Running, status, &payload)
            .await?;
        Ok(status)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
