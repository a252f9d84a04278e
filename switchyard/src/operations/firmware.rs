//! Firmware upgrade: pre-flight check, download, optional activation.

use std::sync::Arc;

use async_trait::async_trait;
use device_fanout::FailurePolicy;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{command_task, parse_args, DeviceBackend, DeviceCommand};
use crate::domain::{DeviceFilter, DeviceTarget};
use crate::executor::{JobContext, Operation};
use crate::inventory::TargetResolver;
use crate::Result;

/// Lock shared by operations that touch many devices at once.
pub const DEVICES_LOCK: &str = "devices";

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FirmwareUpgradeArgs {
    hostname: Option<String>,
    group: Option<String>,
    filename: String,
    url: Option<String>,
    #[serde(default = "default_true")]
    pre_flight: bool,
    #[serde(default = "default_true")]
    download_only: bool,
}

/// Upgrades firmware on the selected devices.
///
/// Pre-flight is fail-fast, download is collect-and-report, activation is
/// fail-fast and only runs on hosts whose download succeeded.
pub struct FirmwareUpgrade {
    resolver: TargetResolver,
    backend: Arc<dyn DeviceBackend>,
    default_url: String,
}

impl FirmwareUpgrade {
    pub fn new(
        resolver: TargetResolver,
        backend: Arc<dyn DeviceBackend>,
        default_url: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            backend,
            default_url: default_url.into(),
        }
    }
}

#[async_trait]
impl Operation for FirmwareUpgrade {
    fn name(&self) -> &'static str {
        "firmware_upgrade"
    }

    async fn run(&self, ctx: &JobContext, args: serde_json::Value) -> Result<serde_json::Value> {
        let args: FirmwareUpgradeArgs = parse_args(self.name(), args)?;
        let filter = DeviceFilter::from_selection(args.hostname, args.group)?;
        let url = args.url.unwrap_or_else(|| self.default_url.clone());

        ctx.acquire_lock(DEVICES_LOCK).await?;
        let targets = self.resolver.resolve(&filter).await?;
        info!(
            job_id = ctx.job_id(),
            %filter,
            devices = targets.len(),
            "Devices selected for firmware upgrade"
        );

        let mut stages = serde_json::Map::new();

        if args.pre_flight {
            let checked = ctx
                .fanout(
                    "pre_flight",
                    targets.clone(),
                    command_task(self.backend.clone(), DeviceCommand::PreFlightCheck),
                    FailurePolicy::FailFast,
                )
                .await?;
            stages.insert("pre_flight".into(), checked.to_json());
        } else {
            info!(job_id = ctx.job_id(), "Skipping pre-flight check");
        }

        let downloaded = ctx
            .fanout(
                "firmware_download",
                targets.clone(),
                command_task(
                    self.backend.clone(),
                    DeviceCommand::FirmwareDownload {
                        url,
                        filename: args.filename.clone(),
                    },
                ),
                FailurePolicy::CollectAndReport,
            )
            .await?;
        stages.insert("firmware_download".into(), downloaded.to_json());

        if args.download_only {
            info!(job_id = ctx.job_id(), "Will not activate new firmware");
        } else {
            let succeeded = downloaded.succeeded_hosts();
            let ready: Vec<DeviceTarget> = targets
                .into_iter()
                .filter(|t| succeeded.contains(t.hostname.as_str()))
                .collect();

            if ready.is_empty() {
                stages.insert(
                    "firmware_activate".into(),
                    json!({ "skipped": "no device downloaded the firmware" }),
                );
            } else {
                let activated = ctx
                    .fanout(
                        "firmware_activate",
                        ready,
                        command_task(
                            self.backend.clone(),
                            DeviceCommand::FirmwareActivate {
                                filename: args.filename.clone(),
                            },
                        ),
                        FailurePolicy::FailFast,
                    )
                    .await?;
                stages.insert("firmware_activate".into(), activated.to_json());
            }
        }

        ctx.release_lock(DEVICES_LOCK).await?;

        let failed_downloads: Vec<&str> = downloaded.failed_hosts().into_iter().collect();
        Ok(json!({
            "filter": filter.to_string(),
            "filename": args.filename,
            "all_succeeded": failed_downloads.is_empty(),
            "failed_hosts": failed_downloads,
            "stages": stages,
        }))
    }
}
