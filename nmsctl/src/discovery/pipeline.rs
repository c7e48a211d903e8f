use async_trait::async_trait;
use futures::future::join_all;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::registry::{RunGuard, RunRegistry};
use super::{DiscoveryError, NetworkProber, ip};
use crate::config::PluginConfig;
use crate::db::errors::DbError;
use crate::db::handlers::{Discoveries, Repository};
use crate::db::models::credentials::Credential;
use crate::db::models::discoveries::{DiscoveryDBResponse, NewDiscoveryResult};
use crate::plugin::models::{DiscoveryRequest, DiscoveryResponse};
use crate::plugin::{self, PluginGateway, PluginRequest};
use crate::types::{CredentialId, DiscoveryId, DiscoveryStatus, ResultStatus};

/// A discovery with the full rows of its candidate credentials.
#[derive(Debug, Clone)]
pub struct DiscoveryTarget {
    pub discovery: DiscoveryDBResponse,
    pub credentials: Vec<Credential>,
}

/// Persistence used by a pipeline run.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    async fn fetch(&self, id: DiscoveryId) -> Result<Option<DiscoveryTarget>, DbError>;
    async fn clear_results(&self, id: DiscoveryId) -> Result<u64, DbError>;
    async fn insert_results(&self, id: DiscoveryId, results: &[NewDiscoveryResult]) -> Result<u64, DbError>;
    async fn set_status(&self, id: DiscoveryId, status: DiscoveryStatus) -> Result<bool, DbError>;
}

pub struct PgDiscoveryStore {
    pool: PgPool,
}

impl PgDiscoveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiscoveryStore for PgDiscoveryStore {
    async fn fetch(&self, id: DiscoveryId) -> Result<Option<DiscoveryTarget>, DbError> {
        let mut conn = self.pool.acquire().await?;
        let mut repo = Discoveries::new(&mut conn);
        let Some(discovery) = repo.get_by_id(id).await? else {
            return Ok(None);
        };
        let credentials = repo.credentials(id).await?;
        Ok(Some(DiscoveryTarget { discovery, credentials }))
    }

    async fn clear_results(&self, id: DiscoveryId) -> Result<u64, DbError> {
        let mut conn = self.pool.acquire().await?;
        Discoveries::new(&mut conn).clear_results(id).await
    }

    async fn insert_results(&self, id: DiscoveryId, results: &[NewDiscoveryResult]) -> Result<u64, DbError> {
        let mut conn = self.pool.acquire().await?;
        Discoveries::new(&mut conn).insert_results(id, results).await
    }

    async fn set_status(&self, id: DiscoveryId, status: DiscoveryStatus) -> Result<bool, DbError> {
        let mut conn = self.pool.acquire().await?;
        Discoveries::new(&mut conn).set_status(id, status).await
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub probed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl DiscoveryReport {
    fn record(&mut self, results: &[NewDiscoveryResult]) {
        for result in results {
            match result.status {
                ResultStatus::Completed => self.completed += 1,
                ResultStatus::Failed => self.failed += 1,
            }
        }
    }
}

pub struct DiscoveryPipeline {
    store: Arc<dyn DiscoveryStore>,
    prober: Arc<dyn NetworkProber>,
    plugin: Arc<dyn PluginGateway>,
    plugin_config: PluginConfig,
    max_ip_count: usize,
    runs: RunRegistry,
}

impl DiscoveryPipeline {
    pub fn new(
        store: Arc<dyn DiscoveryStore>,
        prober: Arc<dyn NetworkProber>,
        plugin: Arc<dyn PluginGateway>,
        plugin_config: PluginConfig,
        max_ip_count: usize,
        runs: RunRegistry,
    ) -> Self {
        Self {
            store,
            prober,
            plugin,
            plugin_config,
            max_ip_count,
            runs,
        }
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    /// Claim `id` and run the pipeline in a background task. Fails immediately if the id is
    /// already running.
    pub fn spawn(self: &Arc<Self>, id: DiscoveryId) -> Result<JoinHandle<Result<DiscoveryReport, DiscoveryError>>, DiscoveryError> {
        let guard = self.runs.try_acquire(id).ok_or(DiscoveryError::AlreadyRunning(id))?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run_claimed(guard).await }))
    }

    /// Run the pipeline for `id` to completion.
    pub async fn run(&self, id: DiscoveryId) -> Result<DiscoveryReport, DiscoveryError> {
        let guard = self.runs.try_acquire(id).ok_or(DiscoveryError::AlreadyRunning(id))?;
        self.run_claimed(guard).await
    }

    #[instrument(skip(self, guard), fields(discovery_id = guard.id()))]
    async fn run_claimed(&self, guard: RunGuard) -> Result<DiscoveryReport, DiscoveryError> {
        let id = guard.id();
        let outcome = self.execute(id).await;

        let status = match &outcome {
            Ok(report) => {
                info!(
                    "Discovery {} completed: {} probed, {} completed, {} failed",
                    id, report.probed, report.completed, report.failed
                );
                DiscoveryStatus::Completed
            }
            Err(DiscoveryError::NotFound(_)) => {
                error!("Discovery {} no longer exists", id);
                return outcome;
            }
            Err(e) => {
                error!("Discovery {} failed: {}", id, e);
                DiscoveryStatus::Failed
            }
        };

        if let Err(e) = self.store.set_status(id, status).await {
            error!("Failed to mark discovery {} as {}: {}", id, status, e);
            if outcome.is_ok() {
                return Err(e.into());
            }
        }
        outcome
    }

    async fn execute(&self, id: DiscoveryId) -> Result<DiscoveryReport, DiscoveryError> {
        let target = self.store.fetch(id).await?.ok_or(DiscoveryError::NotFound(id))?;
        let discovery = &target.discovery;
        let port = u16::try_from(discovery.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| DiscoveryError::InvalidTarget {
                id,
                reason: format!("port {} is out of range", discovery.port),
            })?;

        let cleared = self.store.clear_results(id).await?;
        if cleared > 0 {
            info!("Cleared {} results from the previous run of discovery {}", cleared, id);
        }

        let addresses = ip::expand(&discovery.ip, discovery.ip_type, self.max_ip_count);
        let mut report = DiscoveryReport {
            probed: addresses.len(),
            ..Default::default()
        };
        if addresses.is_empty() {
            warn!("Discovery {} has no addresses to probe ({} {:?})", id, discovery.ip, discovery.ip_type);
            return Ok(report);
        }

        let responding = self.ping_stage(id, &addresses, &mut report).await?;
        let open = self.port_stage(id, responding, port, &mut report).await?;
        self.credential_stage(id, open, port, &target.credentials, &mut report).await?;

        Ok(report)
    }

    async fn persist(&self, id: DiscoveryId, results: &[NewDiscoveryResult], report: &mut DiscoveryReport) -> Result<(), DiscoveryError> {
        self.store.insert_results(id, results).await?;
        report.record(results);
        Ok(())
    }

    async fn ping_stage(&self, id: DiscoveryId, addresses: &[IpAddr], report: &mut DiscoveryReport) -> Result<Vec<IpAddr>, DiscoveryError> {
        let timeout = self.plugin_config.discovery_timeout(addresses.len());
        let outcomes = self.prober.ping(addresses, timeout).await;

        let mut responding = Vec::new();
        let mut failed = Vec::new();
        let mut accounted = HashSet::new();
        for (ip, outcome) in outcomes {
            if !accounted.insert(ip) {
                continue;
            }
            if outcome.reachable {
                responding.push(ip);
            } else {
                failed.push(NewDiscoveryResult::failed(ip.to_string(), outcome.message));
            }
        }
        failed.extend(
            addresses
                .iter()
                .filter(|ip| !accounted.contains(*ip))
                .map(|ip| NewDiscoveryResult::failed(ip.to_string(), "No response from fping")),
        );

        info!("Discovery {} ping stage: {} responding, {} failed", id, responding.len(), failed.len());
        self.persist(id, &failed, report).await?;
        Ok(responding)
    }

    async fn port_stage(
        &self,
        id: DiscoveryId,
        responding: Vec<IpAddr>,
        port: u16,
        report: &mut DiscoveryReport,
    ) -> Result<Vec<IpAddr>, DiscoveryError> {
        if responding.is_empty() {
            return Ok(responding);
        }

        let attempts = responding.iter().map(|ip| {
            let prober = Arc::clone(&self.prober);
            let ip = *ip;
            tokio::spawn(async move { prober.check_port(ip, port).await })
        });
        // Barrier: every attempt settles before the credential stage starts
        let outcomes = join_all(attempts).await;

        let mut open = Vec::new();
        let mut failed = Vec::new();
        for (ip, outcome) in responding.into_iter().zip(outcomes) {
            match outcome {
                Ok(outcome) if outcome.reachable => open.push(ip),
                Ok(outcome) => failed.push(NewDiscoveryResult::failed(ip.to_string(), outcome.message)),
                Err(e) => failed.push(NewDiscoveryResult::failed(ip.to_string(), format!("Port check aborted: {e}"))),
            }
        }

        info!("Discovery {} port stage: {} open, {} failed", id, open.len(), failed.len());
        self.persist(id, &failed, report).await?;
        Ok(open)
    }

    async fn credential_stage(
        &self,
        id: DiscoveryId,
        open: Vec<IpAddr>,
        port: u16,
        credentials: &[Credential],
        report: &mut DiscoveryReport,
    ) -> Result<(), DiscoveryError> {
        if open.is_empty() {
            return Ok(());
        }

        let request = PluginRequest::Discovery(DiscoveryRequest {
            id,
            ips: open.iter().map(|ip| ip.to_string()).collect(),
            port,
            credentials: credentials.iter().map(Credential::plugin_blob).collect(),
        });

        let results = match plugin::call::<DiscoveryResponse>(self.plugin.as_ref(), &request).await {
            Ok(response) => credential_results(&open, credentials, response),
            Err(e) => {
                warn!("Credential check for discovery {} failed: {}", id, e);
                let message = e.to_string();
                open.iter()
                    .map(|ip| NewDiscoveryResult::failed(ip.to_string(), message.clone()))
                    .collect()
            }
        };

        let matched = results.iter().filter(|r| r.status == ResultStatus::Completed).count();
        info!("Discovery {} credential stage: {} matched, {} failed", id, matched, results.len() - matched);
        self.persist(id, &results, report).await
    }
}

/// One result per address in `open`, taken from the plugin's reply where it has one.
fn credential_results(open: &[IpAddr], credentials: &[Credential], response: DiscoveryResponse) -> Vec<NewDiscoveryResult> {
    let candidates: HashSet<CredentialId> = credentials.iter().map(|c| c.id).collect();
    let mut by_ip: HashMap<IpAddr, NewDiscoveryResult> = HashMap::new();

    for check in response.result {
        let Ok(ip) = check.ip.trim().parse::<IpAddr>() else {
            warn!("Ignoring credential result for unparsable address '{}'", check.ip);
            continue;
        };
        if by_ip.contains_key(&ip) {
            continue;
        }

        let result = match (check.success, check.credential_id()) {
            (true, Some(credential_id)) if candidates.contains(&credential_id) => {
                NewDiscoveryResult::completed(ip.to_string(), credential_id, check.message.clone())
            }
            (true, Some(credential_id)) => {
                NewDiscoveryResult::failed(ip.to_string(), format!("Plugin matched unknown credential {credential_id}"))
            }
            (true, None) => NewDiscoveryResult::failed(ip.to_string(), "Plugin reported success without a credential"),
            (false, _) => NewDiscoveryResult::failed(ip.to_string(), check.message.clone()),
        };
        by_ip.insert(ip, result);
    }

    open.iter()
        .map(|ip| {
            by_ip
                .remove(ip)
                .unwrap_or_else(|| NewDiscoveryResult::failed(ip.to_string(), "No result from plugin"))
        })
        .collect()
}
