//! Plugin gateway.
//!
//! All device probing and data collection is delegated to an external executable invoked as
//! `plugin '<json request>'`, which must print a single JSON document on stdout before it exits.
//! The gateway computes a deadline for every request from its type and size, kills the process
//! when the deadline passes, and turns every failure mode (spawn errors, timeouts, unparsable
//! output, an `error` field in the payload) into a [`PluginError`] instead of panicking the caller.
//!
//! [`PluginGateway`] is the seam used by the scheduler and the discovery pipeline;
//! [`SubprocessPlugin`] is the production implementation.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::config::PluginConfig;

pub mod models;
pub mod subprocess;

pub use models::PluginRequest;
pub use subprocess::SubprocessPlugin;

/// Errors that can occur while invoking the plugin
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Failed to start plugin {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plugin execution timed out after {}s", timeout.as_secs())]
    Timeout { timeout: Duration },

    #[error("Plugin returned invalid output: {message}")]
    InvalidOutput { message: String },

    #[error("Plugin reported an error: {0}")]
    Reported(String),

    #[error("Plugin gateway is closed")]
    Unavailable,
}

/// A single request/response exchange with the plugin.
#[async_trait]
pub trait PluginGateway: Send + Sync {
    /// Run one request to completion or failure. Never blocks past the request's deadline.
    async fn invoke(&self, request: &serde_json::Value) -> Result<serde_json::Value, PluginError>;
}

/// Deadline for one request: base time plus a per-item allowance that depends on the request type.
pub fn timeout_for(config: &PluginConfig, request: &serde_json::Value) -> Duration {
    let count = |key: &str| request.get(key).and_then(|v| v.as_array()).map_or(0, |items| items.len());

    match request.get("type").and_then(|t| t.as_str()) {
        Some("discovery") => config.discovery_timeout(count("ips")),
        Some("polling") => config.polling_timeout(count("metric_groups")),
        _ => config.default_timeout(),
    }
}

/// Serialize a typed request, invoke the gateway and decode the reply.
pub async fn call<R: DeserializeOwned>(gateway: &dyn PluginGateway, request: &PluginRequest) -> Result<R, PluginError> {
    let payload = serde_json::to_value(request).map_err(|e| PluginError::InvalidOutput {
        message: format!("request could not be encoded: {e}"),
    })?;
    let reply = gateway.invoke(&payload).await?;
    serde_json::from_value(reply).map_err(|e| PluginError::InvalidOutput {
        message: format!("unexpected response shape: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::models::{PollingItem, PollingRequest, PollingResponse};
    use crate::types::MetricType;
    use serde_json::json;

    #[test]
    fn polling_timeout_scales_with_group_count() {
        let config = PluginConfig {
            base_time_secs: 5,
            polling_timeout_per_metric_group_secs: 10,
            ..Default::default()
        };
        let request = json!({"type": "polling", "metric_groups": [{}, {}, {}]});
        assert_eq!(timeout_for(&config, &request), Duration::from_secs(35));
    }

    #[test]
    fn discovery_and_unknown_timeouts() {
        let config = PluginConfig::default();
        let discovery = json!({"type": "discovery", "id": 1, "ips": ["a", "b", "c", "d"], "port": 22, "credentials": []});
        assert_eq!(timeout_for(&config, &discovery), Duration::from_secs(9));

        assert_eq!(timeout_for(&config, &json!({"type": "inventory"})), Duration::from_secs(15));
        assert_eq!(timeout_for(&config, &json!({})), Duration::from_secs(15));
    }

    struct Echo;

    #[async_trait]
    impl PluginGateway for Echo {
        async fn invoke(&self, request: &serde_json::Value) -> Result<serde_json::Value, PluginError> {
            let groups: Vec<_> = request["metric_groups"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|g| json!({"monitor_id": g["monitor_id"], "name": g["name"], "success": true, "data": "{}"}))
                .collect();
            Ok(json!({ "metric_groups": groups }))
        }
    }

    #[tokio::test]
    async fn call_round_trips_typed_request() {
        let request = PluginRequest::Polling(PollingRequest {
            metric_groups: vec![PollingItem {
                monitor_id: 3,
                name: MetricType::Memory,
                ip: "10.0.0.3".to_string(),
                port: 22,
                credential: json!({}),
            }],
        });

        let reply: PollingResponse = call(&Echo, &request).await.unwrap();
        assert_eq!(reply.metric_groups.len(), 1);
        assert_eq!(reply.metric_groups[0].name, "MEMORY");
        assert!(reply.metric_groups[0].success);
    }
}
