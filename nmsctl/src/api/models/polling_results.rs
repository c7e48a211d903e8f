//! API models for collected polling data.

use crate::db::models::polling_results::PollingResult;
use crate::types::{MetricType, MonitorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct ListPollingResultsQuery {
    pub monitor_id: Option<MonitorId>,
    pub name: Option<MetricType>,
    pub limit: Option<i64>,
}

impl ListPollingResultsQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingResultResponse {
    pub id: i64,
    pub monitor_id: MonitorId,
    pub name: MetricType,
    /// An object, an array, or the raw string the plugin returned
    pub data: serde_json::Value,
    pub time: DateTime<Utc>,
}

impl From<PollingResult> for PollingResultResponse {
    fn from(db: PollingResult) -> Self {
        Self {
            id: db.id,
            monitor_id: db.monitor_id,
            name: db.name,
            data: db.data,
            time: db.time,
        }
    }
}
