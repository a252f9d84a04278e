//! Named job locks.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A held named lock. At most one exists per name at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub name: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub abort_requested: bool,
}

impl Lock {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "job_id": self.job_id,
            "created_at": self.created_at.to_rfc3339(),
            "abort_requested": self.abort_requested,
        })
    }
}

/// Identifies a lock either by its name or by the job that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Name(String),
    JobId(String),
}

impl LockKey {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn job(job_id: impl Into<String>) -> Self {
        Self::JobId(job_id.into())
    }

    /// Build a key from optional name and job id; exactly one must be given.
    pub fn from_parts(name: Option<String>, job_id: Option<String>) -> crate::Result<Self> {
        match (name, job_id) {
            (Some(name), None) => Ok(Self::Name(name)),
            (None, Some(job_id)) => Ok(Self::JobId(job_id)),
            _ => Err(crate::Error::validation(
                "exactly one of lock name or job id must be given",
            )),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name '{name}'"),
            Self::JobId(job_id) => write!(f, "job {job_id}"),
        }
    }
}
