//! # Device Fanout
//!
//! Runs one task per target device concurrently, with bounded parallelism and
//! per-device failure isolation, and aggregates the per-host outcomes.
//!
//! ## Features
//!
//! - Generic over the target type (anything implementing [`FanoutTarget`])
//! - Two failure policies: fail-fast and collect-and-report
//! - Per-device timeout, panics recorded as that host's failure
//! - Cooperative stop through [`FanoutObserver::should_stop`], checked before each device
//!

mod observer;
mod outcome;
mod runner;

pub use observer::{FanoutObserver, NoopObserver};
pub use outcome::{AggregatedResult, DeviceOutcome, StopReason};
pub use runner::{DeviceTaskRunner, FanoutConfig};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Anything a task can be fanned out to.
pub trait FanoutTarget: Clone + Send + Sync + 'static {
    /// Unique key used in the aggregated result.
    fn hostname(&self) -> &str;
}

/// Failure of a single device's task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceTaskError {
    #[error("{0}")]
    Command(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl DeviceTaskError {
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}

/// Result of running a task against one device.
pub type TaskResult = std::result::Result<serde_json::Value, DeviceTaskError>;

/// A unit of work executed once per device.
#[async_trait]
pub trait DeviceTask<T: FanoutTarget>: Send + Sync {
    async fn run(&self, target: T) -> TaskResult;
}

#[async_trait]
impl<T, F, Fut> DeviceTask<T> for F
where
    T: FanoutTarget,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn run(&self, target: T) -> TaskResult {
        (self)(target).await
    }
}

/// Failure policy for one fan-out stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop starting new devices at the first failure and fail the stage.
    FailFast,
    /// Run every device, record failures, report the full breakdown.
    CollectAndReport,
}

/// Stage-level error returned by the runner. Both variants carry the partial result.
#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("stage '{stage}' failed for: {}", join_hosts(.result.failed_hosts()))]
    FailFast {
        stage: String,
        result: AggregatedResult,
    },

    #[error("stage '{stage}' stopped before completion ({} device(s) not started)", .result.skipped_hosts().len())]
    Stopped {
        stage: String,
        result: AggregatedResult,
    },
}

impl FanoutError {
    pub fn stage(&self) -> &str {
        match self {
            Self::FailFast { stage, .. } | Self::Stopped { stage, .. } => stage,
        }
    }

    pub fn result(&self) -> &AggregatedResult {
        match self {
            Self::FailFast { result, .. } | Self::Stopped { result, .. } => result,
        }
    }

    pub fn into_result(self) -> AggregatedResult {
        match self {
            Self::FailFast { result, .. } | Self::Stopped { result, .. } => result,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

fn join_hosts<'a>(hosts: impl IntoIterator<Item = &'a str>) -> String {
    hosts.into_iter().collect::<Vec<_>>().join(" ")
}
