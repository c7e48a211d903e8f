//! API request/response models for discoveries and their results.

use super::pagination::Pagination;
use crate::db::models::discoveries::{DiscoveryDBResponse, DiscoveryResult};
use crate::discovery::ip::try_expand;
use crate::errors::Error;
use crate::types::{CredentialId, DiscoveryId, DiscoveryStatus, IpType, ResultStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ListDiscoveriesQuery {
    #[serde(flatten)]
    pub pagination: Pagination,

    /// Only discoveries in this status
    pub status: Option<DiscoveryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryCreate {
    pub name: String,
    /// A single address, `start-end`, or `addr/prefix` depending on `ip_type`
    pub ip: String,
    pub ip_type: IpType,
    pub port: i32,
    pub credential_ids: Vec<CredentialId>,
}

/// Only provided fields are changed. `credential_ids` replaces the whole set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryUpdate {
    pub name: Option<String>,
    pub ip: Option<String>,
    pub ip_type: Option<IpType>,
    pub port: Option<i32>,
    pub credential_ids: Option<Vec<CredentialId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
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

impl From<DiscoveryDBResponse> for DiscoveryResponse {
    fn from(db: DiscoveryDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            ip: db.ip,
            ip_type: db.ip_type,
            port: db.port,
            status: db.status,
            credential_ids: db.credential_ids,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResultResponse {
    pub ip: String,
    pub status: ResultStatus,
    pub credential_id: Option<CredentialId>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl From<DiscoveryResult> for DiscoveryResultResponse {
    fn from(db: DiscoveryResult) -> Self {
        Self {
            ip: db.ip,
            status: db.status,
            credential_id: db.credential_id,
            message: db.message,
            time: db.time,
        }
    }
}

/// Body of the 202 returned when a run is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRunAccepted {
    pub discovery_id: DiscoveryId,
    pub message: String,
}

/// Check that an address spec expands to at least one address.
pub fn validate_target(ip: &str, ip_type: IpType, port: i32, max_ip_count: usize) -> Result<(), Error> {
    if !(1..=65535).contains(&port) {
        return Err(Error::BadRequest {
            message: format!("port {port} must be between 1 and 65535"),
        });
    }
    let addresses = try_expand(ip, ip_type, max_ip_count).map_err(|e| Error::BadRequest {
        message: format!("invalid {ip_type:?} address spec: {e}"),
    })?;
    if addresses.is_empty() {
        return Err(Error::BadRequest {
            message: "address spec expands to no addresses".to_string(),
        });
    }
    Ok(())
}

pub fn validate_credential_ids(ids: &[CredentialId]) -> Result<(), Error> {
    if ids.is_empty() {
        return Err(Error::BadRequest {
            message: "at least one credential id is required".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_validation() {
        assert!(validate_target("10.0.0.1", IpType::Single, 22, 1024).is_ok());
        assert!(validate_target("10.0.0.1-10.0.0.9", IpType::Range, 161, 1024).is_ok());
        assert!(validate_target("10.0.0.1", IpType::Single, 0, 1024).is_err());
        assert!(validate_target("10.0.0.1", IpType::Single, 70000, 1024).is_err());
        assert!(validate_target("10.0.0.0/8", IpType::Cidr, 22, 1024).is_err());
        assert!(validate_target("10.0.0.1/24", IpType::Single, 22, 1024).is_err());
    }

    #[test]
    fn credential_ids_required() {
        assert!(validate_credential_ids(&[]).is_err());
        assert!(validate_credential_ids(&[1]).is_ok());
    }
}
