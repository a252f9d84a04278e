//! Application-wide error types.

use std::collections::BTreeMap;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Lock '{name}' is already held by job {holder}")]
    LockConflict { name: String, holder: String },

    #[error("Lock not found for {0}")]
    LockNotFound(String),

    #[error("No devices matched {0}")]
    EmptyTargetSet(String),

    #[error("{0}")]
    OperationFailure(String),

    #[error("Stage '{stage}' failed for: {}", describe_failures(.failures))]
    PartialDeviceFailure {
        stage: String,
        /// Failure message per host.
        failures: BTreeMap<String, String>,
    },

    #[error("Abort requested for job {job_id}")]
    AbortRequested { job_id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn operation(msg: impl Into<String>) -> Self {
        Self::OperationFailure(msg.into())
    }

    pub fn aborted(job_id: impl Into<String>) -> Self {
        Self::AbortRequested {
            job_id: job_id.into(),
        }
    }

    /// Hosts that failed, for [`Error::PartialDeviceFailure`].
    pub fn failed_hosts(&self) -> Vec<&str> {
        match self {
            Self::PartialDeviceFailure { failures, .. } => {
                failures.keys().map(String::as_str).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Whether this error is the cooperative cancellation signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::AbortRequested { .. })
    }
}

fn describe_failures(failures: &BTreeMap<String, String>) -> String {
    failures
        .iter()
        .map(|(host, message)| format!("{host} ({message})"))
        .collect::<Vec<_>>()
        .join(", ")
}
