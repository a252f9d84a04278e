//! Job database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{ms_to_datetime, now_ms};
use crate::domain::{JobRecord, JobStatus};
use crate::{Error, Result};

/// Job database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub function_ref: String,
    /// Status name: QUEUED, RUNNING, ABORTING, FINISHED, EXCEPTION, ABORTED
    pub status: String,
    /// JSON object of keyword arguments
    pub start_arguments: String,
    pub scheduled_by: String,
    pub schedule_id: Option<String>,
    pub run_at: i64,
    pub created_at: i64,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    /// JSON array of hostnames
    pub finished_devices: String,
    /// JSON result payload
    pub result: Option<String>,
    pub exception_message: Option<String>,
}

impl JobDbModel {
    /// A new QUEUED job due at `run_at` (epoch ms).
    pub fn new(
        function_ref: impl Into<String>,
        start_arguments: &serde_json::Value,
        scheduled_by: impl Into<String>,
        run_at: i64,
    ) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            function_ref: function_ref.into(),
            status: JobStatus::Queued.as_str().to_string(),
            start_arguments: serde_json::to_string(start_arguments)?,
            scheduled_by: scheduled_by.into(),
            schedule_id: None,
            run_at,
            created_at: now_ms(),
            start_time: None,
            finish_time: None,
            finished_devices: "[]".to_string(),
            result: None,
            exception_message: None,
        })
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn job_status(&self) -> Result<JobStatus> {
        JobStatus::parse(&self.status).ok_or_else(|| {
            Error::Database(format!(
                "job {} has unknown status '{}'",
                self.id, self.status
            ))
        })
    }

    pub fn finished_device_list(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_str(&self.finished_devices)?)
    }
}

impl TryFrom<JobDbModel> for JobRecord {
    type Error = Error;

    fn try_from(model: JobDbModel) -> Result<Self> {
        let status = model.job_status()?;
        let finished_devices = model.finished_device_list()?;
        let result = model
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(JobRecord {
            job_id: model.id,
            status,
            function_ref: model.function_ref,
            start_arguments: serde_json::from_str(&model.start_arguments)?,
            scheduled_by: model.scheduled_by,
            schedule_id: model.schedule_id,
            run_at: ms_to_datetime(model.run_at),
            created_at: ms_to_datetime(model.created_at),
            start_time: model.start_time.map(ms_to_datetime),
            finish_time: model.finish_time.map(ms_to_datetime),
            finished_devices,
            result,
            exception_message: model.exception_message,
        })
    }
}
