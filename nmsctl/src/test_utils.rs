//! Test utilities for handler and lifecycle tests.

use async_trait::async_trait;
use axum_test::TestServer;
use serde_json::{Value, json};
use sqlx::PgPool;
use std::{collections::HashSet, net::IpAddr, sync::Arc, time::Duration};

use crate::{
    AppState, Application, BackgroundServices,
    config::{Config, PoolSettings},
    db::handlers::{Discoveries, Repository},
    discovery::{NetworkProber, ProbeOutcome},
    plugin::{PluginError, PluginGateway},
    types::{DiscoveryId, DiscoveryStatus},
};

/// Answers every discovery request with the first offered credential and every polling request
/// with an empty object per metric group.
#[derive(Debug, Default)]
pub struct StaticPlugin;

#[async_trait]
impl PluginGateway for StaticPlugin {
    async fn invoke(&self, request: &Value) -> Result<Value, PluginError> {
        let items = |key: &str| request[key].as_array().cloned().unwrap_or_default();

        match request["type"].as_str() {
            Some("discovery") => {
                let credential_id = items("credentials").first().map(|c| c["id"].clone());
                let result: Vec<Value> = items("ips")
                    .into_iter()
                    .map(|ip| match &credential_id {
                        Some(id) => json!({"ip": ip, "success": true, "message": "Login succeeded", "credential": {"id": id}}),
                        None => json!({"ip": ip, "success": false, "message": "No credentials offered"}),
                    })
                    .collect();
                Ok(json!({ "result": result }))
            }
            Some("polling") => {
                let groups: Vec<Value> = items("metric_groups")
                    .into_iter()
                    .map(|g| json!({"monitor_id": g["monitor_id"], "name": g["name"], "success": true, "data": "{}"}))
                    .collect();
                Ok(json!({ "metric_groups": groups }))
            }
            _ => Err(PluginError::Reported("unsupported request".to_string())),
        }
    }
}

/// Every address answers ping and has its port open, except the ones in `unreachable`.
#[derive(Debug, Default)]
pub struct StaticProber {
    pub unreachable: HashSet<IpAddr>,
}

#[async_trait]
impl NetworkProber for StaticProber {
    async fn ping(&self, ips: &[IpAddr], _timeout: Duration) -> Vec<(IpAddr, ProbeOutcome)> {
        ips.iter()
            .map(|ip| {
                let outcome = if self.unreachable.contains(ip) {
                    ProbeOutcome::down("Ping check failed: 100% packet loss")
                } else {
                    ProbeOutcome::up("Ping check success")
                };
                (*ip, outcome)
            })
            .collect()
    }

    async fn check_port(&self, ip: IpAddr, port: u16) -> ProbeOutcome {
        ProbeOutcome::up(format!("Port {port} is open on {ip}"))
    }
}

pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    };
    config.database.pool = PoolSettings {
        max_connections: 4,
        min_connections: 0,
        ..Default::default()
    };
    // Tests drive the cache directly; a ticking scheduler would race them
    config.scheduler.enabled = false;
    config
}

/// Build the full application over `pool` with the static plugin and a prober that never
/// reaches `192.0.2.3`.
pub async fn create_test_app(pool: PgPool) -> (TestServer, AppState, BackgroundServices) {
    let prober = StaticProber {
        unreachable: HashSet::from(["192.0.2.3".parse().expect("valid address")]),
    };

    let app = Application::with_collaborators(create_test_config(), pool, Arc::new(StaticPlugin), Arc::new(prober))
        .await
        .expect("Failed to create application");
    let state = app.state().clone();
    let (server, bg) = app.into_test_server();
    (server, state, bg)
}

pub async fn create_test_server(pool: PgPool) -> (TestServer, BackgroundServices) {
    let (server, _state, bg) = create_test_app(pool).await;
    (server, bg)
}

/// Wait for a run started through the API to release its claim, then return the stored status.
pub async fn wait_for_run(state: &AppState, id: DiscoveryId) -> DiscoveryStatus {
    for _ in 0..500 {
        if !state.discovery.runs().is_running(id) {
            let mut conn = state.db.acquire().await.expect("Failed to acquire connection");
            let discovery = Discoveries::new(&mut conn)
                .get_by_id(id)
                .await
                .expect("Failed to load discovery")
                .expect("Discovery should exist");
            return discovery.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Discovery {id} did not finish in time");
}
