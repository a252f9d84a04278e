//! Concrete switch operations built on the job core.
//!
//! Device I/O goes through [`DeviceBackend`]; the command wording here is
//! what a backend is asked to run, the transport is its business.

mod erase;
mod firmware;

pub use erase::DeviceErase;
pub use firmware::FirmwareUpgrade;

use std::sync::Arc;

use async_trait::async_trait;
use device_fanout::{DeviceTask, DeviceTaskError};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::info;

use crate::domain::DeviceTarget;
use crate::inventory::TargetResolver;
use crate::scheduler::OperationRegistry;
use crate::{Error, Result};

/// A command sent to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Check free flash space and clean up old images if needed.
    PreFlightCheck,
    FirmwareDownload { url: String, filename: String },
    FirmwareActivate { filename: String },
    Enable,
    WriteEraseNow,
    RemoveDeviceCertificate,
    RemoveDeviceKey,
    ReloadForce,
}

impl std::fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreFlightCheck => write!(f, "pre-flight check"),
            Self::FirmwareDownload { url, filename } => write!(
                f,
                "copy {}/{} flash:",
                url.trim_end_matches('/'),
                filename.trim_start_matches('/')
            ),
            Self::FirmwareActivate { filename } => write!(f, "boot system flash:{filename}"),
            Self::Enable => write!(f, "enable"),
            Self::WriteEraseNow => write!(f, "write erase now"),
            Self::RemoveDeviceCertificate => write!(f, "delete certificate:switchyard.crt"),
            Self::RemoveDeviceKey => write!(f, "delete sslkey:switchyard.key"),
            Self::ReloadForce => write!(f, "reload force"),
        }
    }
}

/// Runs commands against a single device.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Returns the command output, or an error message.
    async fn run_command(
        &self,
        target: &DeviceTarget,
        command: &DeviceCommand,
    ) -> std::result::Result<String, String>;
}

/// Backend that only logs what it would run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunBackend;

#[async_trait]
impl DeviceBackend for DryRunBackend {
    async fn run_command(
        &self,
        target: &DeviceTarget,
        command: &DeviceCommand,
    ) -> std::result::Result<String, String> {
        info!(host = %target.hostname, %command, "dry-run device command");
        Ok(format!("dry-run: {command}"))
    }
}

/// Per-device task running a single command.
pub(crate) fn command_task(
    backend: Arc<dyn DeviceBackend>,
    command: DeviceCommand,
) -> Arc<dyn DeviceTask<DeviceTarget>> {
    Arc::new(move |target: DeviceTarget| {
        let backend = backend.clone();
        let command = command.clone();
        async move {
            backend
                .run_command(&target, &command)
                .await
                .map(|output| json!({ "command": command.to_string(), "output": output }))
                .map_err(DeviceTaskError::Command)
        }
    })
}

pub(crate) fn parse_args<T: DeserializeOwned>(operation: &str, args: serde_json::Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| Error::validation(format!("invalid arguments for {operation}: {e}")))
}

/// Registry with every built-in operation.
pub fn builtin_registry(
    resolver: TargetResolver,
    backend: Arc<dyn DeviceBackend>,
    firmware_url: impl Into<String>,
) -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry
        .register(Arc::new(FirmwareUpgrade::new(
            resolver.clone(),
            backend.clone(),
            firmware_url,
        )))
        .register(Arc::new(DeviceErase::new(resolver, backend)));
    registry
}
