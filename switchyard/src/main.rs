use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use switchyard::config::AppConfig;
use switchyard::database::repositories::{
    SqlxJobRepository, SqlxLockRepository, SqlxScheduleRepository,
};
use switchyard::domain::DeviceTarget;
use switchyard::inventory::{StaticInventory, TargetResolver};
use switchyard::operations::{builtin_registry, DryRunBackend};
use switchyard::scheduler::{Scheduler, Stores};
use switchyard::{database, logging};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn load_inventory(path: Option<&Path>) -> anyhow::Result<StaticInventory> {
    let Some(path) = path else {
        warn!("No inventory file configured, operations will find no devices");
        return Ok(StaticInventory::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading inventory {}", path.display()))?;
    let devices: Vec<DeviceTarget> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing inventory {}", path.display()))?;
    info!(devices = devices.len(), path = %path.display(), "Loaded device inventory");
    Ok(StaticInventory::new(devices))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let (logging, _log_guard) = logging::init_logging(config.log_dir.as_deref())?;

    let shutdown_token = CancellationToken::new();
    logging.start_retention_cleanup(shutdown_token.clone());

    let pool = database::connect(&config.database()).await?;
    database::run_migrations(&pool).await?;

    let stores = Stores {
        jobs: Arc::new(SqlxJobRepository::new(pool.clone())),
        locks: Arc::new(SqlxLockRepository::new(pool.clone())),
        schedules: Arc::new(SqlxScheduleRepository::new(pool.clone())),
    };

    let inventory = load_inventory(config.inventory_file.as_deref())?;
    let resolver = TargetResolver::new(Arc::new(inventory));
    let registry = builtin_registry(resolver, Arc::new(DryRunBackend), &config.firmware_url);

    let scheduler = Scheduler::new(config.scheduler(), stores, registry, config.fanout());
    let report = scheduler.recover().await?;
    info!(?report, "switchyard started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown_token.cancel();
    scheduler.shutdown().await;
    pool.close().await;

    info!("switchyard stopped");
    Ok(())
}
