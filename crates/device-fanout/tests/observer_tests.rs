//! Fan-out behaviour as seen through an observer.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use device_fanout::{
    DeviceOutcome, DeviceTaskError, DeviceTaskRunner, FailurePolicy, FanoutConfig,
    FanoutObserver, FanoutTarget, StopReason,
};
use serde_json::json;

#[derive(Debug, Clone)]
struct Switch {
    name: String,
}

impl FanoutTarget for Switch {
    fn hostname(&self) -> &str {
        &self.name
    }
}

fn switches(names: &[&str]) -> Vec<Switch> {
    names
        .iter()
        .map(|n| Switch {
            name: n.to_string(),
        })
        .collect()
}

/// Records hostnames in completion order.
#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn push(&self, host: &str) {
        self.0.lock().unwrap().push(host.to_string());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Stops the fan-out once `stop_after` devices have finished.
struct StopAfter {
    stop_after: usize,
    finished: AtomicUsize,
    stop_checks: AtomicUsize,
    recorder: Recorder,
}

impl StopAfter {
    fn new(stop_after: usize) -> Self {
        Self {
            stop_after,
            finished: AtomicUsize::new(0),
            stop_checks: AtomicUsize::new(0),
            recorder: Recorder::default(),
        }
    }
}

#[async_trait]
impl FanoutObserver for StopAfter {
    async fn should_stop(&self) -> bool {
        self.stop_checks.fetch_add(1, Ordering::SeqCst);
        self.finished.load(Ordering::SeqCst) >= self.stop_after
    }

    async fn device_finished(&self, stage: &str, hostname: &str, _outcome: &DeviceOutcome) {
        assert_eq!(stage, "sync");
        self.recorder.push(hostname);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn stop_request_between_devices_keeps_completed_results() {
    let runner = DeviceTaskRunner::new(FanoutConfig {
        parallelism: 1,
        device_timeout_secs: 5,
    });
    let observer = StopAfter::new(1);
    let started = Arc::new(AtomicUsize::new(0));

    let counter = started.clone();
    let task = move |sw: Switch| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DeviceTaskError>(json!({ "synced": sw.name }))
        }
    };

    let err = runner
        .run(
            "sync",
            switches(&["h1", "h2", "h3"]),
            Arc::new(task),
            FailurePolicy::CollectAndReport,
            &observer,
        )
        .await
        .unwrap_err();

    assert!(err.is_stopped());
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(observer.recorder.snapshot(), vec!["h1".to_string()]);

    let result = err.into_result();
    assert_eq!(result.stop_reason(), Some(StopReason::Requested));
    assert_eq!(result.succeeded_hosts(), BTreeSet::from(["h1"]));
    assert_eq!(result.skipped_hosts(), BTreeSet::from(["h2", "h3"]));
    assert_eq!(
        result.outcome("h1"),
        Some(&DeviceOutcome::Succeeded {
            payload: json!({ "synced": "h1" })
        })
    );
}

#[tokio::test]
async fn observer_is_consulted_before_every_device() {
    let runner = DeviceTaskRunner::new(FanoutConfig {
        parallelism: 2,
        device_timeout_secs: 5,
    });
    let observer = StopAfter::new(usize::MAX);
    let task = |_sw: Switch| async move { Ok::<_, DeviceTaskError>(json!(null)) };

    let result = runner
        .run(
            "sync",
            switches(&["a", "b", "c", "d"]),
            Arc::new(task),
            FailurePolicy::FailFast,
            &observer,
        )
        .await
        .unwrap();

    assert!(result.all_succeeded());
    assert_eq!(observer.stop_checks.load(Ordering::SeqCst), 4);
    let mut finished = observer.recorder.snapshot();
    finished.sort();
    assert_eq!(finished, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn collect_and_report_runs_past_failures() {
    let runner = DeviceTaskRunner::new(FanoutConfig {
        parallelism: 1,
        device_timeout_secs: 5,
    });
    let h3_ran = Arc::new(AtomicBool::new(false));
    let flag = h3_ran.clone();
    let task = move |sw: Switch| {
        let flag = flag.clone();
        async move {
            match sw.name.as_str() {
                "h2" => Err(DeviceTaskError::command("copy failed: timeout")),
                "h3" => {
                    flag.store(true, Ordering::SeqCst);
                    Ok(json!("downloaded"))
                }
                _ => Ok(json!("downloaded")),
            }
        }
    };

    let result = runner
        .run(
            "download",
            switches(&["h1", "h2", "h3"]),
            Arc::new(task),
            FailurePolicy::CollectAndReport,
            &device_fanout::NoopObserver,
        )
        .await
        .unwrap();

    assert!(h3_ran.load(Ordering::SeqCst));
    assert_eq!(result.failed_hosts(), BTreeSet::from(["h2"]));
    assert!(!result.all_succeeded());
    assert!(result.skipped_hosts().is_empty());
}

#[tokio::test]
async fn stop_request_takes_precedence_over_fail_fast() {
    let runner = DeviceTaskRunner::new(FanoutConfig {
        parallelism: 1,
        device_timeout_secs: 5,
    });
    let observer = StopAfter::new(1);
    let task = |sw: Switch| async move {
        if sw.name == "h1" {
            Err(DeviceTaskError::command("link down"))
        } else {
            Ok(json!(null))
        }
    };

    let err = runner
        .run(
            "sync",
            switches(&["h1", "h2", "h3"]),
            Arc::new(task),
            FailurePolicy::FailFast,
            &observer,
        )
        .await
        .unwrap_err();

    assert!(err.is_stopped());
    let result = err.into_result();
    assert_eq!(result.stop_reason(), Some(StopReason::Requested));
    assert_eq!(result.failed_hosts(), BTreeSet::from(["h1"]));
    assert_eq!(result.skipped_hosts(), BTreeSet::from(["h2", "h3"]));
}
