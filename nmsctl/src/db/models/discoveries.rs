use crate::types::{CredentialId, DiscoveryId, DiscoveryStatus, IpType, ResultStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Discovery row from the `discoveries` table.
#[derive(Debug, Clone, FromRow)]
pub struct Discovery {
    pub id: DiscoveryId,
    pub name: String,
    pub ip: String,
    pub ip_type: IpType,
    pub port: i32,
    pub status: DiscoveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A discovery together with its candidate credential ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDBResponse {
    pub id: DiscoveryId,
    pub name: String,
    pub ip: String,
    pub ip_type: IpType,
    pub port: i32,
    pub status: DiscoveryStatus,
    pub credential_ids: Vec<CredentialId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveryDBResponse {
    pub fn from_parts(discovery: Discovery, credential_ids: Vec<CredentialId>) -> Self {
        Self {
            id: discovery.id,
            name: discovery.name,
            ip: discovery.ip,
            ip_type: discovery.ip_type,
            port: discovery.port,
            status: discovery.status,
            credential_ids,
            created_at: discovery.created_at,
            updated_at: discovery.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryCreateDBRequest {
    pub name: String,
    pub ip: String,
    pub ip_type: IpType,
    pub port: i32,
    pub credential_ids: Vec<CredentialId>,
}

/// Partial update. `None` leaves the column untouched; `credential_ids` replaces the whole set.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryUpdateDBRequest {
    pub name: Option<String>,
    pub ip: Option<String>,
    pub ip_type: Option<IpType>,
    pub port: Option<i32>,
    pub credential_ids: Option<Vec<CredentialId>>,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub skip: i64,
    pub limit: i64,
    pub status: Option<DiscoveryStatus>,
}

/// Per-IP outcome row from `discovery_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DiscoveryResult {
    pub discovery_id: DiscoveryId,
    pub credential_id: Option<CredentialId>,
    pub ip: String,
    pub message: String,
    pub status: ResultStatus,
    pub time: DateTime<Utc>,
}

/// A result produced by a pipeline stage, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDiscoveryResult {
    pub ip: String,
    pub credential_id: Option<CredentialId>,
    pub message: String,
    pub status: ResultStatus,
}

impl NewDiscoveryResult {
    pub fn failed(ip: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            credential_id: None,
            message: message.into(),
            status: ResultStatus::Failed,
        }
    }

    pub fn completed(ip: impl Into<String>, credential_id: CredentialId, message: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            credential_id: Some(credential_id),
            message: message.into(),
            status: ResultStatus::Completed,
        }
    }
}
