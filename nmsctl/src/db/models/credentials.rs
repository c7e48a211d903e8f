use crate::types::CredentialId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::FromRow;

/// A device credential as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Credential {
    pub id: CredentialId,
    pub name: String,
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// The opaque credential object handed to the plugin.
    pub fn plugin_blob(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "username": self.username,
            "password": self.password,
        })
    }
}

pub type CredentialDBResponse = Credential;

#[derive(Debug, Clone)]
pub struct CredentialCreateDBRequest {
    pub name: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct CredentialUpdateDBRequest {
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}
