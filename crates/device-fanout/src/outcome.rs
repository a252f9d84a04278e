//! Per-device outcomes and their aggregation.

use std::collections::{BTreeMap, BTreeSet};

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::DeviceTaskError;

/// Outcome of one device's task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceOutcome {
    Succeeded { payload: serde_json::Value },
    Failed { message: String },
}

impl DeviceOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl From<Result<serde_json::Value, DeviceTaskError>> for DeviceOutcome {
    fn from(result: Result<serde_json::Value, DeviceTaskError>) -> Self {
        match result {
            Ok(payload) => Self::Succeeded { payload },
            Err(e) => Self::Failed {
                message: e.to_string(),
            },
        }
    }
}

/// Why a run stopped starting devices before reaching the end of its target list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A device failed under the fail-fast policy.
    FailFast,
    /// The observer asked the run to stop.
    Requested,
}

/// Aggregated outcome of one fan-out stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResult {
    outcomes: BTreeMap<String, DeviceOutcome>,
    skipped: BTreeSet<String>,
    stopped: Option<StopReason>,
}

impl AggregatedResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, hostname: impl Into<String>, outcome: DeviceOutcome) {
        self.outcomes.insert(hostname.into(), outcome);
    }

    pub(crate) fn skip(&mut self, hostname: impl Into<String>) {
        self.skipped.insert(hostname.into());
    }

    pub(crate) fn stop(&mut self, reason: StopReason) {
        self.stopped.get_or_insert(reason);
    }

    /// Outcome per host for every device whose task ran.
    pub fn outcomes(&self) -> &BTreeMap<String, DeviceOutcome> {
        &self.outcomes
    }

    pub fn outcome(&self, hostname: &str) -> Option<&DeviceOutcome> {
        self.outcomes.get(hostname)
    }

    pub fn failed_hosts(&self) -> BTreeSet<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_failed())
            .map(|(h, _)| h.as_str())
            .collect()
    }

    pub fn succeeded_hosts(&self) -> BTreeSet<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_failed())
            .map(|(h, _)| h.as_str())
            .collect()
    }

    /// Hosts whose task was never started.
    pub fn skipped_hosts(&self) -> BTreeSet<&str> {
        self.skipped.iter().map(String::as_str).collect()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    /// True when every target ran and none failed.
    pub fn all_succeeded(&self) -> bool {
        self.skipped.is_empty() && self.outcomes.values().all(|o| !o.is_failed())
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.skipped.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for AggregatedResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AggregatedResult", 5)?;
        state.serialize_field("hosts", &self.outcomes)?;
        state.serialize_field("failed_hosts", &self.failed_hosts())?;
        state.serialize_field("skipped_hosts", &self.skipped)?;
        state.serialize_field("all_succeeded", &self.all_succeeded())?;
        state.serialize_field("stopped", &self.stopped)?;
        state.end()
    }
}
