//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use switchyard::database::models::JobDbModel;
use switchyard::database::repositories::{
    JobRepository, SqlxJobRepository, SqlxLockRepository, SqlxScheduleRepository,
};
use switchyard::database::time::now_ms;
use switchyard::database::{DbPool, init_pool, run_migrations};
use switchyard::domain::DeviceTarget;
use switchyard::operations::{DeviceBackend, DeviceCommand};
use switchyard::scheduler::Stores;
use tempfile::TempDir;

/// File-backed database with migrations applied. Keep the `TempDir` alive.
pub async fn setup_test_db() -> (TempDir, DbPool) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("switchyard.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool(&db_url)
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    (dir, pool)
}

pub fn stores(pool: &DbPool) -> Stores {
    Stores {
        jobs: Arc::new(SqlxJobRepository::new(pool.clone())),
        locks: Arc::new(SqlxLockRepository::new(pool.clone())),
        schedules: Arc::new(SqlxScheduleRepository::new(pool.clone())),
    }
}

/// Insert a QUEUED job due now and return its id.
pub async fn queue_job(
    jobs: &dyn JobRepository,
    function_ref: &str,
    args: serde_json::Value,
) -> String {
    let job = JobDbModel::new(function_ref, &args, "tester", now_ms()).unwrap();
    jobs.create_job(&job).await.unwrap();
    job.id
}

pub fn hosts(names: &[&str]) -> Vec<DeviceTarget> {
    names.iter().map(|name| DeviceTarget::new(*name)).collect()
}

/// Device backend that fails commands by host and command prefix and
/// records every call.
#[derive(Default)]
pub struct ScriptedBackend {
    failures: HashMap<(String, String), String>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail commands on `host` whose text starts with `prefix`.
    pub fn fail(mut self, host: &str, prefix: &str, message: &str) -> Self {
        self.failures
            .insert((host.to_string(), prefix.to_string()), message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, command)| command)
            .collect()
    }
}

#[async_trait]
impl DeviceBackend for ScriptedBackend {
    async fn run_command(
        &self,
        target: &DeviceTarget,
        command: &DeviceCommand,
    ) -> Result<String, String> {
        let text = command.to_string();
        self.calls
            .lock()
            .unwrap()
            .push((target.hostname.clone(), text.clone()));

        let failure = self
            .failures
            .iter()
            .find(|((host, prefix), _)| host == &target.hostname && text.starts_with(prefix.as_str()));
        match failure {
            Some((_, message)) => Err(message.clone()),
            None => Ok(format!("{}: ok", text)),
        }
    }
}
