//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::JobDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::JobStatus;
use crate::{Error, Result};

/// Terminal payload written together with the final status.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Result(serde_json::Value),
    Exception(String),
}

/// Job repository trait.
///
/// Status writes are compare-and-set: they only apply when the stored status
/// still equals `from`, otherwise they fail with `InvalidStateTransition`.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    /// Most recent jobs in `status`, newest first.
    async fn list_jobs_by_status(&self, status: JobStatus, limit: i64)
    -> Result<Vec<JobDbModel>>;
    async fn list_recent_jobs(&self, limit: i64) -> Result<Vec<JobDbModel>>;
    /// Jobs in QUEUED, RUNNING or ABORTING, oldest first.
    async fn list_non_terminal_jobs(&self) -> Result<Vec<JobDbModel>>;
    /// QUEUED -> RUNNING, recording the start time.
    async fn mark_running(&self, id: &str) -> Result<()>;
    /// Non-terminal status change such as RUNNING -> ABORTING.
    async fn update_status(&self, id: &str, from: JobStatus, to: JobStatus) -> Result<()>;
    /// Write the terminal status, finish time and payload.
    async fn finalize(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        outcome: &JobOutcome,
    ) -> Result<()>;
    /// Append a hostname to `finished_devices`.
    async fn append_finished_device(&self, id: &str, hostname: &str) -> Result<()>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Turn a zero-row compare-and-set into the right error.
    async fn lost_transition(&self, id: &str, to: JobStatus) -> Error {
        match self.get_job(id).await {
            Ok(job) => Error::InvalidStateTransition {
                from: job.status,
                to: to.as_str().to_string(),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_job", || async {
            sqlx::query(
                r#"
                INSERT INTO job (
                    id, function_ref, status, start_arguments, scheduled_by, schedule_id,
                    run_at, created_at, start_time, finish_time, finished_devices,
                    result, exception_message
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.function_ref)
            .bind(&job.status)
            .bind(&job.start_arguments)
            .bind(&job.scheduled_by)
            .bind(&job.schedule_id)
            .bind(job.run_at)
            .bind(job.created_at)
            .bind(job.start_time)
            .bind(job.finish_time)
            .bind(&job.finished_devices)
            .bind(&job.result)
            .bind(&job.exception_message)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_recent_jobs(&self, limit: i64) -> Result<Vec<JobDbModel>> {
        let jobs =
            sqlx::query_as::<_, JobDbModel>("SELECT * FROM job ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(jobs)
    }

    async fn list_non_terminal_jobs(&self) -> Result<Vec<JobDbModel>> {
        let [queued, running, aborting] = JobStatus::non_terminal();
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status IN (?, ?, ?) ORDER BY created_at",
        )
        .bind(queued.as_str())
        .bind(running.as_str())
        .bind(aborting.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn mark_running(&self, id: &str) -> Result<()> {
        let started = now_ms();
        let updated = retry_on_sqlite_busy("mark_job_running", || async {
            let result = sqlx::query(
                "UPDATE job SET status = ?, start_time = ? WHERE id = ? AND status = ?",
            )
            .bind(JobStatus::Running.as_str())
            .bind(started)
            .bind(id)
            .bind(JobStatus::Queued.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(self.lost_transition(id, JobStatus::Running).await);
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, from: JobStatus, to: JobStatus) -> Result<()> {
        from.transition_to(to)?;
        if to.is_terminal() {
            return Err(Error::Database(format!(
                "terminal status {to} must be written with finalize"
            )));
        }

        let updated = retry_on_sqlite_busy("update_job_status", || async {
            let result = sqlx::query("UPDATE job SET status = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(self.lost_transition(id, to).await);
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        outcome: &JobOutcome,
    ) -> Result<()> {
        from.transition_to(to)?;
        if !to.is_terminal() {
            return Err(Error::Database(format!("{to} is not a terminal status")));
        }

        let (result_json, exception) = match outcome {
            JobOutcome::Result(value) => (Some(serde_json::to_string(value)?), None),
            JobOutcome::Exception(message) => (None, Some(message.as_str())),
        };
        let finished = now_ms();

        let updated = retry_on_sqlite_busy("finalize_job", || async {
            let result = sqlx::query(
                r#"
                UPDATE job
                SET status = ?, finish_time = ?, result = ?, exception_message = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(finished)
            .bind(&result_json)
            .bind(exception)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(self.lost_transition(id, to).await);
        }
        Ok(())
    }

    async fn append_finished_device(&self, id: &str, hostname: &str) -> Result<()> {
        let updated = retry_on_sqlite_busy("append_finished_device", || async {
            let result = sqlx::query(
                "UPDATE job SET finished_devices = json_insert(finished_devices, '$[#]', ?) WHERE id = ?",
            )
            .bind(hostname)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }
}
