//! API request/response models for provisioned monitors.

use super::pagination::Pagination;
use crate::db::models::monitors::{MetricGroup, MetricGroupUpdateDBRequest, MonitorDBResponse};
use crate::errors::Error;
use crate::types::{CredentialId, DiscoveryId, MetricGroupId, MetricType, MonitorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
pub struct ListProvisionsQuery {
    #[serde(flatten)]
    pub pagination: Pagination,
}

/// Provision every successful result of a finished discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionCreate {
    pub discovery_id: DiscoveryId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricGroupResponse {
    pub id: MetricGroupId,
    pub name: MetricType,
    pub polling_interval: i32,
    pub is_enabled: bool,
}

impl From<MetricGroup> for MetricGroupResponse {
    fn from(db: MetricGroup) -> Self {
        Self {
            id: db.id,
            name: db.name,
            polling_interval: db.polling_interval,
            is_enabled: db.is_enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorResponse {
    pub id: MonitorId,
    pub ip: String,
    pub port: i32,
    pub credential_id: CredentialId,
    pub credential_name: String,
    pub metric_groups: Vec<MetricGroupResponse>,
    pub created_at: DateTime<Utc>,
}

impl From<MonitorDBResponse> for MonitorResponse {
    fn from(db: MonitorDBResponse) -> Self {
        Self {
            id: db.monitor.id,
            ip: db.monitor.ip,
            port: db.monitor.port,
            credential_id: db.monitor.credential_id,
            credential_name: db.credential.name,
            metric_groups: db.metric_groups.into_iter().map(MetricGroupResponse::from).collect(),
            created_at: db.monitor.created_at,
        }
    }
}

/// Change to one metric group, addressed by name. `None` keeps the stored value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricGroupUpdate {
    pub name: MetricType,
    pub polling_interval: Option<i32>,
    pub is_enabled: Option<bool>,
}

/// Validate a batch of metric group changes. Intervals must be whole minutes and each name may
/// appear once.
pub fn validate_metric_group_updates(updates: Vec<MetricGroupUpdate>) -> Result<Vec<MetricGroupUpdateDBRequest>, Error> {
    if updates.is_empty() {
        return Err(Error::BadRequest {
            message: "at least one metric group update is required".to_string(),
        });
    }

    let mut names = HashSet::new();
    updates
        .into_iter()
        .map(|update| {
            if !names.insert(update.name) {
                return Err(Error::BadRequest {
                    message: format!("metric group {} appears more than once", update.name),
                });
            }
            if let Some(interval) = update.polling_interval
                && (interval < 60 || interval % 60 != 0)
            {
                return Err(Error::BadRequest {
                    message: format!("polling_interval {interval} must be a positive multiple of 60 seconds"),
                });
            }
            Ok(MetricGroupUpdateDBRequest {
                name: update.name,
                polling_interval: update.polling_interval,
                is_enabled: update.is_enabled,
            })
        })
        .collect()
}
