//! API request/response models for credentials.

use super::pagination::Pagination;
use crate::db::models::credentials::{CredentialCreateDBRequest, CredentialDBResponse, CredentialUpdateDBRequest};
use crate::errors::Error;
use crate::types::CredentialId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ListCredentialsQuery {
    #[serde(flatten)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialCreate {
    pub name: String,
    pub username: String,
    pub password: String,
}

/// Only provided fields are changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialUpdate {
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A credential as returned by the API. The password is never echoed back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialResponse {
    pub id: CredentialId,
    pub name: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

impl From<CredentialDBResponse> for CredentialResponse {
    fn from(db: CredentialDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            username: db.username,
            created_at: db.created_at,
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::BadRequest {
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

impl CredentialCreate {
    pub fn into_db_request(self) -> Result<CredentialCreateDBRequest, Error> {
        require_non_empty("name", &self.name)?;
        require_non_empty("username", &self.username)?;
        Ok(CredentialCreateDBRequest {
            name: self.name.trim().to_string(),
            username: self.username,
            password: self.password,
        })
    }
}

impl CredentialUpdate {
    pub fn into_db_request(self) -> Result<CredentialUpdateDBRequest, Error> {
        if let Some(name) = &self.name {
            require_non_empty("name", name)?;
        }
        if let Some(username) = &self.username {
            require_non_empty("username", username)?;
        }
        Ok(CredentialUpdateDBRequest {
            name: self.name.map(|n| n.trim().to_string()),
            username: self.username,
            password: self.password,
        })
    }
}
