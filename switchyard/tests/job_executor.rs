//! Job executor lifecycle: terminal status, lock cleanup, abort and fan-out policies.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use common::{hosts, queue_job, setup_test_db, stores};
use device_fanout::{DeviceTaskError, FailurePolicy, FanoutConfig};
use serde_json::{Value, json};
use switchyard::database::repositories::{JobOutcome, LockRepository};
use switchyard::domain::{DeviceTarget, JobRecord, JobStatus, LockKey};
use switchyard::executor::{JobContext, JobExecutor, Operation};
use switchyard::scheduler::Stores;
use switchyard::{Error, Result};

fn sequential() -> FanoutConfig {
    FanoutConfig {
        parallelism: 1,
        device_timeout_secs: 5,
    }
}

fn executor(stores: &Stores, fanout: FanoutConfig) -> JobExecutor {
    JobExecutor::new(stores.jobs.clone(), stores.locks.clone(), fanout)
}

async fn record(stores: &Stores, job_id: &str) -> JobRecord {
    stores.jobs.get_job(job_id).await.unwrap().try_into().unwrap()
}

/// Takes a lock, then fails with a configuration error.
struct BadConfig;

#[async_trait]
impl Operation for BadConfig {
    fn name(&self) -> &'static str {
        "bad_config"
    }

    async fn run(&self, ctx: &JobContext, _args: Value) -> Result<Value> {
        ctx.acquire_lock("sync").await?;
        Err(Error::validation("bad config"))
    }
}

/// Echoes its arguments back and checks the job is RUNNING meanwhile.
struct Echo {
    observed: Arc<parking_lot::Mutex<Option<JobStatus>>>,
    stores: Stores,
}

#[async_trait]
impl Operation for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn run(&self, ctx: &JobContext, args: Value) -> Result<Value> {
        let job = self.stores.jobs.get_job(ctx.job_id()).await?;
        *self.observed.lock() = job.job_status().ok();
        Ok(json!({ "echo": args, "by": ctx.scheduled_by() }))
    }
}

struct Panics;

#[async_trait]
impl Operation for Panics {
    fn name(&self) -> &'static str {
        "panics"
    }

    async fn run(&self, ctx: &JobContext, _args: Value) -> Result<Value> {
        ctx.acquire_lock("sync").await?;
        panic!("driver bug");
    }
}

/// Takes the same lock twice.
struct Relock;

#[async_trait]
impl Operation for Relock {
    fn name(&self) -> &'static str {
        "relock"
    }

    async fn run(&self, ctx: &JobContext, _args: Value) -> Result<Value> {
        ctx.acquire_lock("sync").await?;
        ctx.acquire_lock("sync").await?;
        Ok(json!(null))
    }
}

/// Fans a task over h1..h3 where h2 fails, under the given policy, then
/// runs a second stage.
struct TwoStage {
    policy: FailurePolicy,
    second_stage_ran: Arc<AtomicBool>,
}

#[async_trait]
impl Operation for TwoStage {
    fn name(&self) -> &'static str {
        "two_stage"
    }

    async fn run(&self, ctx: &JobContext, _args: Value) -> Result<Value> {
        ctx.acquire_lock("devices").await?;
        let task = |target: DeviceTarget| async move {
            if target.hostname == "h2" {
                Err(DeviceTaskError::command("copy failed"))
            } else {
                Ok(json!("ok"))
            }
        };
        let first = ctx
            .fanout("first", hosts(&["h1", "h2", "h3"]), Arc::new(task), self.policy)
            .await?;

        let flag = self.second_stage_ran.clone();
        let second = move |_target: DeviceTarget| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, DeviceTaskError>(json!("done"))
            }
        };
        ctx.fanout(
            "second",
            hosts(&["h1"]),
            Arc::new(second),
            FailurePolicy::CollectAndReport,
        )
        .await?;

        ctx.release_lock("devices").await?;
        Ok(first.to_json())
    }
}

/// Syncs h1..h3 one at a time; h1 requests abort of the "sync" lock while running.
/// With `h1_fails` set, h1 also fails and the stage runs fail-fast.
struct AbortDuringSync {
    locks: Arc<dyn LockRepository>,
    started: Arc<AtomicUsize>,
    h3_started: Arc<AtomicBool>,
    h1_fails: bool,
}

#[async_trait]
impl Operation for AbortDuringSync {
    fn name(&self) -> &'static str {
        "sync_devices"
    }

    async fn run(&self, ctx: &JobContext, _args: Value) -> Result<Value> {
        ctx.acquire_lock("sync").await?;

        let locks = self.locks.clone();
        let started = self.started.clone();
        let h3_started = self.h3_started.clone();
        let h1_fails = self.h1_fails;
        let task = move |target: DeviceTarget| {
            let locks = locks.clone();
            let started = started.clone();
            let h3_started = h3_started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                match target.hostname.as_str() {
                    "h1" => {
                        locks
                            .request_abort(&LockKey::name("sync"))
                            .await
                            .map_err(|e| DeviceTaskError::command(e.to_string()))?;
                        if h1_fails {
                            return Err(DeviceTaskError::command("sync failed"));
                        }
                    }
                    "h3" => h3_started.store(true, Ordering::SeqCst),
                    _ => {}
                }
                Ok::<_, DeviceTaskError>(json!({ "synced": target.hostname }))
            }
        };

        let result = ctx
            .fanout(
                "sync",
                hosts(&["h1", "h2", "h3"]),
                Arc::new(task),
                if self.h1_fails {
                    FailurePolicy::FailFast
                } else {
                    FailurePolicy::CollectAndReport
                },
            )
            .await?;
        Ok(result.to_json())
    }
}

#[tokio::test]
async fn failing_operation_ends_in_exception_and_releases_lock() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let job_id = queue_job(stores.jobs.as_ref(), "bad_config", json!({})).await;

    let status = executor(&stores, sequential())
        .execute(&job_id, Arc::new(BadConfig))
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Exception);
    let job = record(&stores, &job_id).await;
    assert_eq!(job.status, JobStatus::Exception);
    assert!(job.exception_message.unwrap().contains("bad config"));
    assert!(job.result.is_none());
    assert!(job.start_time.is_some());
    assert!(job.finish_time.is_some());
    assert!(stores.locks.get(&LockKey::name("sync")).await.unwrap().is_none());
}

#[tokio::test]
async fn successful_operation_records_result_and_start_arguments() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let args = json!({ "hostname": "sw1", "dry_run": true });
    let job_id = queue_job(stores.jobs.as_ref(), "echo", args.clone()).await;

    let observed = Arc::new(parking_lot::Mutex::new(None));
    let op = Echo {
        observed: observed.clone(),
        stores: stores.clone(),
    };
    let status = executor(&stores, sequential())
        .execute(&job_id, Arc::new(op))
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Finished);
    assert_eq!(*observed.lock(), Some(JobStatus::Running));

    let job = record(&stores, &job_id).await;
    assert_eq!(job.start_arguments, args);
    assert_eq!(job.result, Some(json!({ "echo": args, "by": "tester" })));
    assert!(job.exception_message.is_none());
    assert_eq!(job.to_json()["status"], "FINISHED");
}

#[tokio::test]
async fn panicking_operation_is_recorded_as_exception() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let job_id = queue_job(stores.jobs.as_ref(), "panics", json!({})).await;

    let status = executor(&stores, sequential())
        .execute(&job_id, Arc::new(Panics))
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Exception);
    let job = record(&stores, &job_id).await;
    assert!(job.exception_message.unwrap().contains("driver bug"));
    assert!(stores.locks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn terminal_status_is_written_exactly_once() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let job_id = queue_job(stores.jobs.as_ref(), "bad_config", json!({})).await;
    let executor = executor(&stores, sequential());

    executor.execute(&job_id, Arc::new(BadConfig)).await.unwrap();

    let again = executor.execute(&job_id, Arc::new(BadConfig)).await;
    assert!(matches!(again, Err(Error::InvalidStateTransition { .. })));

    let overwrite = stores
        .jobs
        .finalize(
            &job_id,
            JobStatus::Running,
            JobStatus::Finished,
            &JobOutcome::Result(json!("late")),
        )
        .await;
    assert!(matches!(overwrite, Err(Error::InvalidStateTransition { .. })));

    let job = record(&stores, &job_id).await;
    assert_eq!(job.status, JobStatus::Exception);
    assert!(job.result.is_none());
}

#[tokio::test]
async fn lock_conflict_fails_the_job_and_keeps_the_other_lock() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    assert!(stores.locks.acquire("sync", "other-job").await.unwrap());
    let job_id = queue_job(stores.jobs.as_ref(), "bad_config", json!({})).await;

    let status = executor(&stores, sequential())
        .execute(&job_id, Arc::new(BadConfig))
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Exception);
    let job = record(&stores, &job_id).await;
    assert!(job.exception_message.unwrap().contains("other-job"));
    let lock = stores.locks.get(&LockKey::name("sync")).await.unwrap().unwrap();
    assert_eq!(lock.job_id, "other-job");
}

#[tokio::test]
async fn collect_and_report_finishes_with_partial_breakdown() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let job_id = queue_job(stores.jobs.as_ref(), "two_stage", json!({})).await;
    let second_stage_ran = Arc::new(AtomicBool::new(false));

    let status = executor(&stores, FanoutConfig::default())
        .execute(
            &job_id,
            Arc::new(TwoStage {
                policy: FailurePolicy::CollectAndReport,
                second_stage_ran: second_stage_ran.clone(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Finished);
    assert!(second_stage_ran.load(Ordering::SeqCst));

    let job = record(&stores, &job_id).await;
    let result = job.result.unwrap();
    assert_eq!(result["failed_hosts"], json!(["h2"]));
    assert_eq!(result["all_succeeded"], json!(false));
    assert_eq!(result["hosts"]["h1"]["status"], "succeeded");
    assert_eq!(result["hosts"]["h2"]["message"], "copy failed");

    let mut finished = job.finished_devices.clone();
    finished.sort();
    assert_eq!(finished, vec!["h1", "h1", "h2", "h3"]);
}

#[tokio::test]
async fn fail_fast_ends_in_exception_without_later_stages() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let job_id = queue_job(stores.jobs.as_ref(), "two_stage", json!({})).await;
    let second_stage_ran = Arc::new(AtomicBool::new(false));

    let status = executor(&stores, FanoutConfig::default())
        .execute(
            &job_id,
            Arc::new(TwoStage {
                policy: FailurePolicy::FailFast,
                second_stage_ran: second_stage_ran.clone(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Exception);
    assert!(!second_stage_ran.load(Ordering::SeqCst));

    let job = record(&stores, &job_id).await;
    let message = job.exception_message.unwrap();
    assert_eq!(message, "Stage 'first' failed for: h2 (copy failed)");
    assert!(stores.locks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn abort_between_devices_stops_the_fanout() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let job_id = queue_job(stores.jobs.as_ref(), "sync_devices", json!({})).await;
    let started = Arc::new(AtomicUsize::new(0));
    let h3_started = Arc::new(AtomicBool::new(false));

    let status = executor(&stores, sequential())
        .execute(
            &job_id,
            Arc::new(AbortDuringSync {
                locks: stores.locks.clone(),
                started: started.clone(),
                h3_started: h3_started.clone(),
                h1_fails: false,
            }),
        )
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Aborted);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert!(!h3_started.load(Ordering::SeqCst));

    let job = record(&stores, &job_id).await;
    assert_eq!(job.status, JobStatus::Aborted);
    assert!(job.exception_message.is_none());
    assert_eq!(job.finished_devices, vec!["h1"]);

    let result = job.result.unwrap();
    assert_eq!(result["aborted"], json!(true));
    assert_eq!(result["stages"]["sync"]["h1"]["status"], "succeeded");
    assert_eq!(result["stages"]["sync"]["h1"]["payload"]["synced"], "h1");
    assert!(result["stages"]["sync"].get("h3").is_none());

    assert!(stores.locks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn abort_wins_over_fail_fast_on_the_same_device() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let job_id = queue_job(stores.jobs.as_ref(), "sync_devices", json!({})).await;
    let started = Arc::new(AtomicUsize::new(0));

    let status = executor(&stores, sequential())
        .execute(
            &job_id,
            Arc::new(AbortDuringSync {
                locks: stores.locks.clone(),
                started: started.clone(),
                h3_started: Arc::new(AtomicBool::new(false)),
                h1_fails: true,
            }),
        )
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Aborted);
    assert_eq!(started.load(Ordering::SeqCst), 1);

    let job = record(&stores, &job_id).await;
    assert!(job.exception_message.is_none());
    let result = job.result.unwrap();
    assert_eq!(result["stages"]["sync"]["h1"]["message"], "sync failed");
    assert!(stores.locks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn reacquiring_a_held_lock_is_rejected() {
    let (_dir, pool) = setup_test_db().await;
    let stores = stores(&pool);
    let job_id = queue_job(stores.jobs.as_ref(), "relock", json!({})).await;

    let status = executor(&stores, sequential())
        .execute(&job_id, Arc::new(Relock))
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Exception);
    let message = record(&stores, &job_id).await.exception_message.unwrap();
    assert!(message.contains("already holds lock 'sync'"), "{message}");
    assert!(!message.contains("is already held by job"), "{message}");
    assert!(stores.locks.list().await.unwrap().is_empty());
}
