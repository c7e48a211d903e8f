//! Polling scheduler.
//!
//! A single background task ticks every `scheduler.checking_interval_secs`. Each tick asks the
//! [`MonitorCache`] which metric groups are due, sends all of them to the plugin in one
//! `polling` request and appends the successful items to `polling_results` in one insert.
//!
//! A tick never waits for the previous round: dispatch runs in its own task, bounded by the
//! polling timeout computed from the number of due groups. Failed items and failed rounds are
//! not retried; the countdown was already restarted, so the groups come due again on their
//! next cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedMetricGroup, MonitorCache};
use crate::config::PluginConfig;
use crate::db::errors::DbError;
use crate::db::handlers::PollingResults;
use crate::db::models::polling_results::NewPollingResult;
use crate::plugin::models::{PollingItem, PollingRequest, PollingResponse};
use crate::plugin::{self, PluginError, PluginGateway, PluginRequest};
use crate::types::{MetricType, MonitorId};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("Failed to store polling results: {0}")]
    Store(#[from] DbError),
}

/// Where a round's results are appended.
#[async_trait]
pub trait PollingResultSink: Send + Sync {
    async fn insert_batch(&self, results: &[NewPollingResult]) -> Result<u64, DbError>;
}

pub struct PgPollingResultSink {
    pool: PgPool,
}

impl PgPollingResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PollingResultSink for PgPollingResultSink {
    async fn insert_batch(&self, results: &[NewPollingResult]) -> Result<u64, DbError> {
        let mut conn = self.pool.acquire().await?;
        PollingResults::new(&mut conn).insert_batch(results).await
    }
}

#[derive(Clone)]
pub struct PollingScheduler {
    cache: Arc<MonitorCache>,
    plugin: Arc<dyn PluginGateway>,
    sink: Arc<dyn PollingResultSink>,
    plugin_config: PluginConfig,
    interval: Duration,
}

impl PollingScheduler {
    pub fn new(
        cache: Arc<MonitorCache>,
        plugin: Arc<dyn PluginGateway>,
        sink: Arc<dyn PollingResultSink>,
        plugin_config: PluginConfig,
        checking_interval_secs: u64,
    ) -> Self {
        Self {
            cache,
            plugin,
            sink,
            plugin_config,
            interval: Duration::from_secs(checking_interval_secs),
        }
    }

    /// Tick until `shutdown` is cancelled. The first tick fires one full interval after start,
    /// so the cache must already be populated.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting polling scheduler (tick every {}s)", self.interval.as_secs());

        let mut timer = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Polling scheduler shutting down");
                    break;
                }
                _ = timer.tick() => {
                    self.tick();
                }
            }
        }
    }

    /// Advance the cache by one interval and dispatch whatever is due. Returns the dispatch task,
    /// or `None` when nothing was due.
    pub fn tick(&self) -> Option<JoinHandle<Result<u64, PollError>>> {
        let due = self.cache.collect_timed_out_and_tick(self.interval_secs());
        if due.is_empty() {
            debug!("Scheduler tick: nothing due ({} groups cached)", self.cache.len());
            return None;
        }

        info!("Scheduler tick: dispatching {} due metric groups", due.len());
        let this = self.clone();
        Some(tokio::spawn(async move {
            let count = due.len();
            let result = this.poll_due(due).await;
            match &result {
                Ok(inserted) => debug!("Polling round stored {} of {} results", inserted, count),
                Err(PollError::Store(e)) => error!("Failed to persist polling batch of {}: {}", count, e),
                Err(e) => warn!("Polling round for {} metric groups produced no results: {}", count, e),
            }
            result
        }))
    }

    /// One polling round: a single plugin call for every due group, then a single insert.
    pub async fn poll_due(&self, due: Vec<CachedMetricGroup>) -> Result<u64, PollError> {
        if due.is_empty() {
            return Ok(0);
        }

        let timeout = self.plugin_config.polling_timeout(due.len());
        let request = build_request(&due);
        let response: PollingResponse = match tokio::time::timeout(timeout, plugin::call(self.plugin.as_ref(), &request)).await {
            Ok(reply) => reply?,
            Err(_) => return Err(PluginError::Timeout { timeout }.into()),
        };

        let results = collect_results(&due, response, Utc::now());
        if results.is_empty() {
            return Ok(0);
        }

        Ok(self.sink.insert_batch(&results).await?)
    }

    fn interval_secs(&self) -> u32 {
        u32::try_from(self.interval.as_secs()).unwrap_or(u32::MAX)
    }
}

pub fn build_request(due: &[CachedMetricGroup]) -> PluginRequest {
    PluginRequest::Polling(PollingRequest {
        metric_groups: due
            .iter()
            .map(|group| PollingItem {
                monitor_id: group.monitor_id,
                name: group.name,
                ip: group.ip.clone(),
                port: group.port,
                credential: group.credential.clone(),
            })
            .collect(),
    })
}

/// Keep the successful items that answer a group we asked for, stamped with `time`.
pub fn collect_results(due: &[CachedMetricGroup], response: PollingResponse, time: DateTime<Utc>) -> Vec<NewPollingResult> {
    let requested: HashSet<(MonitorId, MetricType)> = due.iter().map(|g| (g.monitor_id, g.name)).collect();

    response
        .metric_groups
        .into_iter()
        .filter(|item| item.success)
        .filter_map(|item| {
            let name = match item.name.parse::<MetricType>() {
                Ok(name) => name,
                Err(e) => {
                    warn!("Dropping polled item for monitor {}: {}", item.monitor_id, e);
                    return None;
                }
            };
            if !requested.contains(&(item.monitor_id, name)) {
                warn!("Dropping unrequested polled item {} for monitor {}", name, item.monitor_id);
                return None;
            }
            Some(NewPollingResult {
                monitor_id: item.monitor_id,
                name,
                data: parse_polled_data(item.data),
                time,
            })
        })
        .collect()
}

/// Plugin data arrives as a string. Keep it as a JSON object if it parses as one, else as a
/// JSON array, else as the raw string.
pub fn parse_polled_data(data: Option<Value>) -> Value {
    match data {
        None | Some(Value::Null) => Value::String(String::new()),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
            _ => Value::String(raw),
        },
        Some(structured @ (Value::Object(_) | Value::Array(_))) => structured,
        Some(other) => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::monitor;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every polling item, failing the ones named in `fail`.
    struct FakePlugin {
        calls: AtomicUsize,
        requests: Mutex<Vec<Value>>,
        fail: Vec<MetricType>,
        delay: Option<Duration>,
        error: Option<String>,
    }

    impl FakePlugin {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                fail: Vec::new(),
                delay: None,
                error: None,
            }
        }
    }

    #[async_trait]
    impl PluginGateway for FakePlugin {
        async fn invoke(&self, request: &Value) -> Result<Value, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.error {
                return Err(PluginError::Reported(message.clone()));
            }

            let groups: Vec<Value> = request["metric_groups"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|g| {
                    let name: MetricType = g["name"].as_str().unwrap().parse().unwrap();
                    let success = !self.fail.contains(&name);
                    json!({
                        "monitor_id": g["monitor_id"],
                        "name": g["name"],
                        "success": success,
                        "data": format!("{{\"metric\": \"{}\"}}", name),
                    })
                })
                .collect();
            Ok(json!({ "metric_groups": groups }))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        batches: Mutex<Vec<Vec<NewPollingResult>>>,
        fail: bool,
    }

    #[async_trait]
    impl PollingResultSink for MemorySink {
        async fn insert_batch(&self, results: &[NewPollingResult]) -> Result<u64, DbError> {
            if self.fail {
                return Err(DbError::Other(anyhow::anyhow!("connection reset")));
            }
            self.batches.lock().unwrap().push(results.to_vec());
            Ok(results.len() as u64)
        }
    }

    fn scheduler(cache: Arc<MonitorCache>, plugin: Arc<FakePlugin>, sink: Arc<MemorySink>) -> PollingScheduler {
        let plugin_config = PluginConfig {
            base_time_secs: 5,
            polling_timeout_per_metric_group_secs: 10,
            ..Default::default()
        };
        PollingScheduler::new(cache, plugin, sink, plugin_config, 30)
    }

    fn seeded_cache() -> Arc<MonitorCache> {
        let cache = Arc::new(MonitorCache::new());
        cache.insert_monitors(&[
            monitor(1, "10.0.0.1", &[(1, MetricType::CpuUsage, 5), (2, MetricType::Disk, 60)]),
            monitor(2, "10.0.0.2", &[(3, MetricType::Memory, 30), (4, MetricType::Uptime, 90)]),
        ]);
        cache
    }

    #[test]
    fn parse_keeps_objects_arrays_and_raw_strings() {
        assert_eq!(parse_polled_data(Some(json!(r#"{"used": 12}"#))), json!({"used": 12}));
        assert_eq!(parse_polled_data(Some(json!("[1, 2, 3]"))), json!([1, 2, 3]));
        assert_eq!(parse_polled_data(Some(json!("load average: 0.42"))), json!("load average: 0.42"));
        assert_eq!(parse_polled_data(Some(json!("42"))), json!("42"));
        assert_eq!(parse_polled_data(Some(json!({"already": "parsed"}))), json!({"already": "parsed"}));
        assert_eq!(parse_polled_data(Some(json!(7))), json!("7"));
        assert_eq!(parse_polled_data(None), json!(""));
    }

    #[tokio::test]
    async fn tick_batches_due_groups_into_one_request_and_one_insert() {
        let cache = seeded_cache();
        let plugin = Arc::new(FakePlugin::new());
        let sink = Arc::new(MemorySink::default());
        let scheduler = scheduler(cache, plugin.clone(), sink.clone());

        let inserted = scheduler.tick().unwrap().await.unwrap().unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);

        let request = plugin.requests.lock().unwrap()[0].clone();
        assert_eq!(request["type"], "polling");
        let mut names: Vec<_> = request["metric_groups"]
            .as_array()
            .unwrap()
            .iter()
            .map(|g| g["name"].as_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["CPUUSAGE", "MEMORY"]);

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].iter().all(|r| r.data.is_object()));
    }

    #[tokio::test]
    async fn nothing_due_means_no_dispatch() {
        let cache = Arc::new(MonitorCache::new());
        cache.insert_monitors(&[monitor(1, "10.0.0.1", &[(1, MetricType::Disk, 300)])]);
        let plugin = Arc::new(FakePlugin::new());
        let scheduler = scheduler(cache.clone(), plugin.clone(), Arc::new(MemorySink::default()));

        assert!(scheduler.tick().is_none());
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.countdown(1), Some(270));
    }

    #[tokio::test]
    async fn failed_items_are_dropped() {
        let cache = seeded_cache();
        let mut fake = FakePlugin::new();
        fake.fail = vec![MetricType::Memory];
        let sink = Arc::new(MemorySink::default());
        let scheduler = scheduler(cache, Arc::new(fake), sink.clone());

        assert_eq!(scheduler.tick().unwrap().await.unwrap().unwrap(), 1);
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].name, MetricType::CpuUsage);
    }

    #[tokio::test]
    async fn gateway_failure_records_nothing_and_countdowns_restart() {
        let cache = seeded_cache();
        let mut fake = FakePlugin::new();
        fake.error = Some("collector crashed".to_string());
        let sink = Arc::new(MemorySink::default());
        let scheduler = scheduler(cache.clone(), Arc::new(fake), sink.clone());

        let err = scheduler.tick().unwrap().await.unwrap().unwrap_err();
        assert!(matches!(err, PollError::Plugin(PluginError::Reported(_))));
        assert!(sink.batches.lock().unwrap().is_empty());
        assert_eq!(cache.countdown(1), Some(5));
        assert_eq!(cache.countdown(3), Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_plugin_is_bounded_by_polling_timeout() {
        let cache = seeded_cache();
        let mut fake = FakePlugin::new();
        fake.delay = Some(Duration::from_secs(600));
        let sink = Arc::new(MemorySink::default());
        let scheduler = scheduler(cache, Arc::new(fake), sink.clone());

        let err = scheduler.tick().unwrap().await.unwrap().unwrap_err();
        // 2 due groups: 5 + 2 * 10
        assert!(matches!(err, PollError::Plugin(PluginError::Timeout { timeout }) if timeout == Duration::from_secs(25)));
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let cache = seeded_cache();
        let sink = Arc::new(MemorySink {
            fail: true,
            ..Default::default()
        });
        let scheduler = scheduler(cache, Arc::new(FakePlugin::new()), sink);

        let err = scheduler.tick().unwrap().await.unwrap().unwrap_err();
        assert!(matches!(err, PollError::Store(_)));
    }

    #[test]
    fn unrequested_and_unknown_items_are_dropped() {
        let cache = seeded_cache();
        let due = cache.collect_timed_out_and_tick(30);
        let response: PollingResponse = serde_json::from_value(json!({
            "metric_groups": [
                {"monitor_id": 1, "name": "CPUUSAGE", "success": true, "data": "{}"},
                {"monitor_id": 1, "name": "GPU", "success": true, "data": "{}"},
                {"monitor_id": 9, "name": "MEMORY", "success": true, "data": "{}"}
            ]
        }))
        .unwrap();

        let results = collect_results(&due, response, Utc::now());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].monitor_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_cancelled() {
        let cache = seeded_cache();
        let plugin = Arc::new(FakePlugin::new());
        let sink = Arc::new(MemorySink::default());
        let scheduler = scheduler(cache, plugin.clone(), sink.clone());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));

        // First tick at 30s, second at 60s
        tokio::time::sleep(Duration::from_secs(65)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(plugin.calls.load(Ordering::SeqCst), 2);
    }
}
