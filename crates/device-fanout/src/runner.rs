//! Bounded concurrent execution of a per-device task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::{
    AggregatedResult, DeviceOutcome, DeviceTask, DeviceTaskError, FailurePolicy, FanoutError,
    FanoutObserver, FanoutTarget, StopReason, TaskResult,
};

/// Configuration for the device task runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Maximum number of devices worked on at the same time.
    pub parallelism: usize,
    /// Per-device timeout in seconds.
    pub device_timeout_secs: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            device_timeout_secs: 300,
        }
    }
}

impl FanoutConfig {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }
}

/// Executes a task once per target, at most `parallelism` at a time.
#[derive(Debug, Clone, Default)]
pub struct DeviceTaskRunner {
    config: FanoutConfig,
}

impl DeviceTaskRunner {
    pub fn new(config: FanoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Run `task` against every target.
    ///
    /// Before each device is started, finished tasks are collected and the
    /// observer is asked whether to stop. Under [`FailurePolicy::FailFast`] the
    /// first recorded failure stops new devices from starting. When both apply
    /// at once the run is reported as stopped. Devices already
    /// started always run to completion; devices never started are reported as
    /// skipped.
    ///
    /// Returns `Ok` for a completed collect-and-report stage or a fail-fast
    /// stage without failures; otherwise an error carrying the partial result.
    pub async fn run<T: FanoutTarget>(
        &self,
        stage: &str,
        targets: Vec<T>,
        task: Arc<dyn DeviceTask<T>>,
        policy: FailurePolicy,
        observer: &dyn FanoutObserver,
    ) -> Result<AggregatedResult, FanoutError> {
        let parallelism = self.config.parallelism.max(1);
        let timeout = self.config.device_timeout();

        info!(
            stage,
            devices = targets.len(),
            parallelism,
            ?policy,
            "Starting device fan-out"
        );

        let mut result = AggregatedResult::new();
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let mut running: HashMap<Id, String> = HashMap::new();
        let mut remaining = targets.into_iter();

        while let Some(target) = remaining.next() {
            while join_set.len() >= parallelism {
                if let Some(joined) = join_set.join_next_with_id().await {
                    settle(stage, joined, &mut running, &mut result, observer).await;
                }
            }
            while let Some(joined) = join_set.try_join_next_with_id() {
                settle(stage, joined, &mut running, &mut result, observer).await;
            }

            // A stop request outranks a fail-fast stop on the same check.
            let stop = if observer.should_stop().await {
                Some(StopReason::Requested)
            } else if policy == FailurePolicy::FailFast && !result.failed_hosts().is_empty() {
                Some(StopReason::FailFast)
            } else {
                None
            };

            if let Some(reason) = stop {
                info!(stage, ?reason, "Not starting further devices");
                result.stop(reason);
                result.skip(target.hostname());
                for target in remaining.by_ref() {
                    result.skip(target.hostname());
                }
                break;
            }

            let hostname = target.hostname().to_string();
            debug!(stage, host = %hostname, "Starting device task");
            let task = task.clone();
            let handle = join_set.spawn(async move {
                match tokio::time::timeout(timeout, task.run(target)).await {
                    Ok(result) => result,
                    Err(_) => Err(DeviceTaskError::Timeout(timeout)),
                }
            });
            running.insert(handle.id(), hostname);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            settle(stage, joined, &mut running, &mut result, observer).await;
        }

        let failed = result.failed_hosts().len();
        info!(
            stage,
            succeeded = result.succeeded_hosts().len(),
            failed,
            skipped = result.skipped_hosts().len(),
            "Device fan-out finished"
        );

        match result.stop_reason() {
            Some(StopReason::Requested) => Err(FanoutError::Stopped {
                stage: stage.to_string(),
                result,
            }),
            _ if policy == FailurePolicy::FailFast && failed > 0 => Err(FanoutError::FailFast {
                stage: stage.to_string(),
                result,
            }),
            _ => Ok(result),
        }
    }
}

/// Record one joined device task, mapping a panic to that host's failure.
async fn settle(
    stage: &str,
    joined: Result<(Id, TaskResult), JoinError>,
    running: &mut HashMap<Id, String>,
    result: &mut AggregatedResult,
    observer: &dyn FanoutObserver,
) {
    let (id, task_result) = match joined {
        Ok((id, task_result)) => (id, task_result),
        Err(join_error) => {
            let id = join_error.id();
            let reason = if join_error.is_panic() {
                "device task panicked".to_string()
            } else {
                join_error.to_string()
            };
            (id, Err(DeviceTaskError::Panicked(reason)))
        }
    };

    let Some(hostname) = running.remove(&id) else {
        warn!(stage, "Joined a device task with no recorded host");
        return;
    };

    let outcome = DeviceOutcome::from(task_result);
    match &outcome {
        DeviceOutcome::Succeeded { .. } => debug!(stage, host = %hostname, "Device task succeeded"),
        DeviceOutcome::Failed { message } => {
            warn!(stage, host = %hostname, error = %message, "Device task failed")
        }
    }

    observer.device_finished(stage, &hostname, &outcome).await;
    result.record(hostname, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopObserver;
    use std::collections::BTreeSet;
    use serde_json::json;

    #[derive(Debug, Clone)]
    struct Host(&'static str);

    impl FanoutTarget for Host {
        fn hostname(&self) -> &str {
            self.0
        }
    }

    fn hosts() -> Vec<Host> {
        vec![Host("h1"), Host("h2"), Host("h3")]
    }

    async fn fail_h2(host: Host) -> TaskResult {
        if host.0 == "h2" {
            Err(DeviceTaskError::command("no space left on flash"))
        } else {
            Ok(json!(format!("{} ok", host.0)))
        }
    }

    #[test]
    fn test_fanout_config_default() {
        let config = FanoutConfig::default();
        assert_eq!(config.parallelism, 10);
        assert_eq!(config.device_timeout(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_collect_and_report_runs_every_device() {
        let runner = DeviceTaskRunner::default();
        let result = runner
            .run(
                "download",
                hosts(),
                Arc::new(fail_h2),
                FailurePolicy::CollectAndReport,
                &NoopObserver,
            )
            .await
            .unwrap();

        assert_eq!(result.outcomes().len(), 3);
        assert_eq!(result.failed_hosts(), BTreeSet::from(["h2"]));
        assert!(!result.all_succeeded());
        assert!(result.stop_reason().is_none());
    }

    #[tokio::test]
    async fn test_fail_fast_sequential_skips_remaining() {
        let runner = DeviceTaskRunner::new(FanoutConfig {
            parallelism: 1,
            device_timeout_secs: 5,
        });
        let err = runner
            .run(
                "pre_flight",
                hosts(),
                Arc::new(fail_h2),
                FailurePolicy::FailFast,
                &NoopObserver,
            )
            .await
            .unwrap_err();

        assert!(!err.is_stopped());
        assert_eq!(err.stage(), "pre_flight");
        let result = err.into_result();
        assert_eq!(result.failed_hosts(), BTreeSet::from(["h2"]));
        assert_eq!(result.skipped_hosts(), BTreeSet::from(["h3"]));
        assert_eq!(result.stop_reason(), Some(StopReason::FailFast));
    }

    #[tokio::test]
    async fn test_fail_fast_without_failures_is_ok() {
        let runner = DeviceTaskRunner::default();
        let task = |host: Host| async move { Ok::<_, DeviceTaskError>(json!(host.0)) };
        let result = runner
            .run(
                "pre_flight",
                hosts(),
                Arc::new(task),
                FailurePolicy::FailFast,
                &NoopObserver,
            )
            .await
            .unwrap();
        assert!(result.all_succeeded());
    }

    #[tokio::test]
    async fn test_timeout_is_a_device_failure() {
        let runner = DeviceTaskRunner::new(FanoutConfig {
            parallelism: 3,
            device_timeout_secs: 1,
        });
        let task = |host: Host| async move {
            if host.0 == "h3" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok::<_, DeviceTaskError>(json!(null))
        };
        let result = runner
            .run(
                "download",
                hosts(),
                Arc::new(task),
                FailurePolicy::CollectAndReport,
                &NoopObserver,
            )
            .await
            .unwrap();

        assert_eq!(result.failed_hosts(), BTreeSet::from(["h3"]));
        assert_eq!(
            result.outcome("h3"),
            Some(&DeviceOutcome::Failed {
                message: "timed out after 1s".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_panic_is_isolated_to_one_host() {
        let runner = DeviceTaskRunner::default();
        let task = |host: Host| async move {
            if host.0 == "h1" {
                panic!("driver bug");
            }
            Ok::<_, DeviceTaskError>(json!(null))
        };
        let result = runner
            .run(
                "download",
                hosts(),
                Arc::new(task),
                FailurePolicy::CollectAndReport,
                &NoopObserver,
            )
            .await
            .unwrap();

        assert_eq!(result.failed_hosts(), BTreeSet::from(["h1"]));
        assert_eq!(result.succeeded_hosts(), BTreeSet::from(["h2", "h3"]));
    }

    #[tokio::test]
    async fn test_empty_target_list() {
        let runner = DeviceTaskRunner::default();
        let result = runner
            .run(
                "download",
                Vec::<Host>::new(),
                Arc::new(fail_h2),
                FailurePolicy::FailFast,
                &NoopObserver,
            )
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(result.all_succeeded());
    }
}
