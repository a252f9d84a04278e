//! Factory reset of a single access switch.

use std::sync::Arc;

use async_trait::async_trait;
use device_fanout::{DeviceTask, DeviceTaskError, FailurePolicy, TaskResult};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{parse_args, DeviceBackend, DeviceCommand};
use crate::domain::{DeviceState, DeviceTarget, DeviceType};
use crate::executor::{JobContext, Operation};
use crate::inventory::TargetResolver;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceEraseArgs {
    hostname: String,
}

/// Erases the configuration of one ACCESS device and reloads it.
pub struct DeviceErase {
    resolver: TargetResolver,
    backend: Arc<dyn DeviceBackend>,
}

impl DeviceErase {
    pub fn new(resolver: TargetResolver, backend: Arc<dyn DeviceBackend>) -> Self {
        Self { resolver, backend }
    }
}

pub(crate) fn lock_name(hostname: &str) -> String {
    format!("device:{hostname}")
}

struct EraseTask {
    backend: Arc<dyn DeviceBackend>,
}

#[async_trait]
impl DeviceTask<DeviceTarget> for EraseTask {
    async fn run(&self, target: DeviceTarget) -> TaskResult {
        for command in [DeviceCommand::Enable, DeviceCommand::WriteEraseNow] {
            self.backend
                .run_command(&target, &command)
                .await
                .map_err(|e| DeviceTaskError::command(format!("factory default failed: {e}")))?;
        }

        // Certificate and key may not exist on the device.
        for command in [DeviceCommand::RemoveDeviceCertificate, DeviceCommand::RemoveDeviceKey] {
            if let Err(e) = self.backend.run_command(&target, &command).await {
                debug!(host = %target.hostname, %command, error = %e, "Ignoring failed cleanup command");
            }
        }

        // The session usually drops while the device reloads.
        if let Err(e) = self
            .backend
            .run_command(&target, &DeviceCommand::ReloadForce)
            .await
        {
            debug!(host = %target.hostname, error = %e, "Reload did not return cleanly");
        }

        Ok(json!("Device factory defaulted"))
    }
}

#[async_trait]
impl Operation for DeviceErase {
    fn name(&self) -> &'static str {
        "device_erase"
    }

    async fn run(&self, ctx: &JobContext, args: serde_json::Value) -> Result<serde_json::Value> {
        let args: DeviceEraseArgs = parse_args(self.name(), args)?;
        let device = self
            .resolver
            .lookup(&args.hostname)
            .await?
            .ok_or_else(|| Error::not_found("Device", &args.hostname))?;

        if device.device_type != DeviceType::Access {
            return Err(Error::operation("can only factory default ACCESS devices"));
        }
        if !matches!(device.state, DeviceState::Managed | DeviceState::Unmanaged) {
            return Err(Error::operation(
                "can only factory default MANAGED or UNMANAGED devices",
            ));
        }

        let lock = lock_name(&device.hostname);
        ctx.acquire_lock(&lock).await?;
        info!(job_id = ctx.job_id(), host = %device.hostname, "Device selected for factory default");

        // A failed erase is reported in the result, the job itself finishes.
        let result = ctx
            .fanout(
                "device_erase",
                vec![device],
                Arc::new(EraseTask {
                    backend: self.backend.clone(),
                }),
                FailurePolicy::CollectAndReport,
            )
            .await?;

        for host in result.failed_hosts() {
            warn!(job_id = ctx.job_id(), host, "Factory default failed");
        }

        ctx.release_lock(&lock).await?;
        Ok(result.to_json())
    }
}
