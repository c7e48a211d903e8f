use crate::types::{MetricType, MonitorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only polling output. `data` is an object, an array, or a JSON string holding raw output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PollingResult {
    pub id: i64,
    pub monitor_id: MonitorId,
    pub name: MetricType,
    pub data: serde_json::Value,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPollingResult {
    pub monitor_id: MonitorId,
    pub name: MetricType,
    pub data: serde_json::Value,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PollingResultFilter {
    pub monitor_id: Option<MonitorId>,
    pub name: Option<MetricType>,
    pub limit: i64,
}
