//! Request and response shapes exchanged with the plugin executable.

use crate::types::{CredentialId, DiscoveryId, MetricType, MonitorId};
use serde::{Deserialize, Serialize};

/// A plugin request. Serialized with a `type` tag, e.g. `{"type":"polling","metric_groups":[..]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PluginRequest {
    Discovery(DiscoveryRequest),
    Polling(PollingRequest),
}

/// Credential validation for the IPs that survived the ping and port checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub id: DiscoveryId,
    pub ips: Vec<String>,
    pub port: u16,
    /// Every candidate credential blob; the plugin reports which one matched per IP
    pub credentials: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingRequest {
    pub metric_groups: Vec<PollingItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingItem {
    pub monitor_id: MonitorId,
    pub name: MetricType,
    pub ip: String,
    pub port: u16,
    pub credential: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(default, alias = "results")]
    pub result: Vec<CredentialCheck>,
}

/// Outcome for one IP of a discovery request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CredentialCheck {
    pub ip: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub credential: Option<MatchedCredential>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MatchedCredential {
    pub id: Option<CredentialId>,
}

impl CredentialCheck {
    pub fn credential_id(&self) -> Option<CredentialId> {
        self.credential.as_ref().and_then(|c| c.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PollingResponse {
    #[serde(default)]
    pub metric_groups: Vec<PolledMetricGroup>,
}

/// Outcome for one metric group of a polling request. `name` stays a string so one unknown
/// name does not invalidate the whole batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PolledMetricGroup {
    pub monitor_id: MonitorId,
    pub name: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}
