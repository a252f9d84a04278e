//! Recurring schedule database model.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{duration_to_ms, now_ms};
use crate::Result;

/// A persisted recurring schedule. Each firing produces its own job row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduleDbModel {
    pub id: String,
    pub function_ref: String,
    pub interval_ms: i64,
    /// JSON object of keyword arguments passed to every firing
    pub kwargs: String,
    pub scheduled_by: String,
    pub created_at: i64,
}

impl ScheduleDbModel {
    pub fn new(
        function_ref: impl Into<String>,
        interval: Duration,
        kwargs: &serde_json::Value,
        scheduled_by: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            function_ref: function_ref.into(),
            interval_ms: duration_to_ms(interval),
            kwargs: serde_json::to_string(kwargs)?,
            scheduled_by: scheduled_by.into(),
            created_at: now_ms(),
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1) as u64)
    }

    pub fn kwargs_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.kwargs)?)
    }
}
