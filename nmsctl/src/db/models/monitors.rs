use crate::db::models::credentials::Credential;
use crate::types::{CredentialId, MetricGroupId, MetricType, MonitorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Monitor row from the `monitors` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Monitor {
    pub id: MonitorId,
    pub ip: String,
    pub port: i32,
    pub credential_id: CredentialId,
    pub created_at: DateTime<Utc>,
}

/// Metric group row. `polling_interval` is the configured period in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MetricGroup {
    pub id: MetricGroupId,
    pub monitor_id: MonitorId,
    pub name: MetricType,
    pub polling_interval: i32,
    pub is_enabled: bool,
}

/// A monitor with everything the scheduler needs to poll it.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorDBResponse {
    pub monitor: Monitor,
    pub credential: Credential,
    pub metric_groups: Vec<MetricGroup>,
}

/// Change to one metric group of a monitor, addressed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricGroupUpdateDBRequest {
    pub name: MetricType,
    pub polling_interval: Option<i32>,
    pub is_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorFilter {
    pub skip: i64,
    pub limit: i64,
}
