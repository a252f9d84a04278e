//! Job lifecycle state machine and the job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a job.
///
/// Stored by name, never by ordinal, so new variants can be added without
/// touching existing rows.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Submitted and waiting for its due time or a worker.
    Queued,
    /// The operation is executing.
    Running,
    /// Abort was observed; the operation is unwinding.
    Aborting,
    /// The operation returned normally.
    Finished,
    /// The operation failed.
    Exception,
    /// The operation stopped after an abort request.
    Aborted,
}

impl JobStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Aborting => "ABORTING",
            Self::Finished => "FINISHED",
            Self::Exception => "EXCEPTION",
            Self::Aborted => "ABORTED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "ABORTING" => Some(Self::Aborting),
            "FINISHED" => Some(Self::Finished),
            "EXCEPTION" => Some(Self::Exception),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Exception | Self::Aborted)
    }

    /// Statuses a job can be left in by a process that dies mid-flight.
    pub fn non_terminal() -> [JobStatus; 3] {
        [Self::Queued, Self::Running, Self::Aborting]
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running)
                | (Running, Finished)
                | (Running, Exception)
                | (Running, Aborting)
                | (Aborting, Aborted)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: JobStatus) -> Result<JobStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One tracked execution of an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub function_ref: String,
    /// Keyword arguments captured at submission. Never modified afterwards.
    pub start_arguments: serde_json::Value,
    pub scheduled_by: String,
    /// Set when the job was produced by a recurring schedule.
    pub schedule_id: Option<String>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    /// Hostnames whose per-device work has completed, in completion order.
    pub finished_devices: Vec<String>,
    pub result: Option<serde_json::Value>,
    pub exception_message: Option<String>,
}

impl JobRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// JSON view served by the job status query.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.job_id,
            "status": self.status.as_str(),
            "function_name": self.function_ref,
            "start_arguments": self.start_arguments,
            "scheduled_by": self.scheduled_by,
            "schedule_id": self.schedule_id,
            "run_at": self.run_at.to_rfc3339(),
            "created_at": self.created_at.to_rfc3339(),
            "start_time": self.start_time.map(|t| t.to_rfc3339()),
            "finish_time": self.finish_time.map(|t| t.to_rfc3339()),
            "finished_devices": self.finished_devices,
            "result": self.result,
            "exception": self.exception_message,
        })
    }
}
