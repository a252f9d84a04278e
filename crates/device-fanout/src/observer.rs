//! Hooks the caller can use to observe and steer a fan-out.

use async_trait::async_trait;

use crate::DeviceOutcome;

/// Consulted by the runner around each device.
#[async_trait]
pub trait FanoutObserver: Send + Sync {
    /// Checked before a device's task is started. Returning `true` stops the
    /// runner from starting any further devices; tasks already running finish.
    async fn should_stop(&self) -> bool {
        false
    }

    /// Called once per device after its outcome is known.
    async fn device_finished(&self, _stage: &str, _hostname: &str, _outcome: &DeviceOutcome) {}
}

/// Observer that never stops and ignores progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl FanoutObserver for NoopObserver {}
