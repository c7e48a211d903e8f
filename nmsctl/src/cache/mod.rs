//! Scheduling state for every enabled metric group.
//!
//! The cache keeps two maps keyed by metric group id:
//!
//! - **canonical**: the configured polling interval of each group, written only by
//!   [`MonitorCache::insert_monitors`] and [`MonitorCache::update_metric_groups`]
//! - **live**: seconds remaining until each group is next due, decremented on every scheduler
//!   tick and reset from canonical when it reaches zero
//!
//! Every key in `live` is also in `canonical`. Writers insert into canonical before live and
//! remove from live before canonical so the property holds between individual map operations
//! too. The only code that holds a lock on both maps at once is the tick, which always locks a
//! live shard first.
//!
//! Deleting a monitor leaves a tombstone for its id. Inserts and updates that race with the
//! delete check it after writing and undo themselves, so a deleted monitor never comes back.
//! Monitor ids are never reused.
//!
//! One `MonitorCache` is built at startup and shared through an `Arc` by the scheduler and the
//! provisioning handlers.

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use sqlx::PgPool;
use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::db::errors::DbError;
use crate::db::handlers::Monitors;
use crate::db::models::credentials::Credential;
use crate::db::models::monitors::{MetricGroup, MonitorDBResponse};
use crate::types::{CredentialId, MetricGroupId, MetricType, MonitorId};

/// Everything needed to poll one metric group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedMetricGroup {
    pub id: MetricGroupId,
    pub monitor_id: MonitorId,
    pub ip: String,
    pub port: u16,
    pub credential_id: CredentialId,
    /// Opaque credential blob handed to the plugin
    pub credential: serde_json::Value,
    pub name: MetricType,
    /// Configured interval in the canonical map, seconds left until due in the live map
    pub polling_interval: u32,
    pub is_enabled: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("metric group {id} of monitor {monitor_id} is malformed: {reason}")]
pub struct MalformedGroup {
    pub id: MetricGroupId,
    pub monitor_id: MonitorId,
    pub reason: String,
}

impl CachedMetricGroup {
    pub fn from_monitor(monitor: &MonitorDBResponse, group: &MetricGroup) -> Result<Self, MalformedGroup> {
        let malformed = |reason: String| MalformedGroup {
            id: group.id,
            monitor_id: monitor.monitor.id,
            reason,
        };

        if group.monitor_id != monitor.monitor.id {
            return Err(malformed(format!("belongs to monitor {}", group.monitor_id)));
        }
        monitor
            .monitor
            .ip
            .parse::<IpAddr>()
            .map_err(|_| malformed(format!("invalid ip '{}'", monitor.monitor.ip)))?;
        let port = u16::try_from(monitor.monitor.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| malformed(format!("invalid port {}", monitor.monitor.port)))?;
        let polling_interval = u32::try_from(group.polling_interval)
            .ok()
            .filter(|i| *i > 0)
            .ok_or_else(|| malformed(format!("invalid polling interval {}", group.polling_interval)))?;

        Ok(Self {
            id: group.id,
            monitor_id: monitor.monitor.id,
            ip: monitor.monitor.ip.clone(),
            port,
            credential_id: monitor.credential.id,
            credential: monitor.credential.plugin_blob(),
            name: group.name,
            polling_interval,
            is_enabled: group.is_enabled,
        })
    }
}

/// A change to one cached group. `None` keeps the current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricGroupUpdate {
    pub id: MetricGroupId,
    pub polling_interval: Option<u32>,
    pub is_enabled: Option<bool>,
}

impl From<&MetricGroup> for MetricGroupUpdate {
    fn from(group: &MetricGroup) -> Self {
        Self {
            id: group.id,
            polling_interval: u32::try_from(group.polling_interval).ok(),
            is_enabled: Some(group.is_enabled),
        }
    }
}

/// What [`MonitorCache::update_metric_groups`] did with each id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub updated: Vec<MetricGroupId>,
    pub removed: Vec<MetricGroupId>,
    /// Ids that were not cached, so nothing was changed for them
    pub missing: Vec<MetricGroupId>,
}

#[derive(Debug, Default)]
pub struct MonitorCache {
    canonical: DashMap<MetricGroupId, CachedMetricGroup>,
    live: DashMap<MetricGroupId, CachedMetricGroup>,
    deleted: DashSet<MonitorId>,
}

impl MonitorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every monitor from the database. Must finish before the scheduler starts ticking.
    pub async fn populate(&self, pool: &PgPool) -> Result<usize, DbError> {
        let mut conn = pool.acquire().await?;
        let monitors = Monitors::new(&mut conn).list_all().await?;
        let inserted = self.insert_monitors(&monitors);
        info!("Monitor cache populated with {} metric groups from {} monitors", inserted, monitors.len());
        Ok(inserted)
    }

    /// Cache every enabled metric group of `monitors` with a fresh countdown equal to its interval.
    /// Malformed groups and groups of deleted monitors are skipped. Returns how many groups were
    /// cached.
    pub fn insert_monitors(&self, monitors: &[MonitorDBResponse]) -> usize {
        let mut inserted = 0;
        for monitor in monitors {
            let monitor_id = monitor.monitor.id;
            if self.deleted.contains(&monitor_id) {
                debug!("Not caching metric groups of deleted monitor {}", monitor_id);
                continue;
            }

            let mut written = Vec::new();
            for group in &monitor.metric_groups {
                if !group.is_enabled {
                    debug!("Skipping disabled metric group {} of monitor {}", group.id, monitor.monitor.id);
                    continue;
                }
                match CachedMetricGroup::from_monitor(monitor, group) {
                    Ok(cached) => {
                        self.canonical.insert(cached.id, cached.clone());
                        self.live.insert(cached.id, cached);
                        written.push(group.id);
                    }
                    Err(e) => warn!("Skipping metric group: {}", e),
                }
            }

            if self.deleted.contains(&monitor_id) {
                debug!("Monitor {} was deleted while caching it, evicting {} groups", monitor_id, written.len());
                self.evict(&written);
                continue;
            }
            inserted += written.len();
        }
        inserted
    }

    /// Apply interval and enablement changes. A new interval restarts the countdown; disabling
    /// removes the group from both maps. Ids that are not cached are reported in
    /// [`UpdateOutcome::missing`] and otherwise ignored, as are groups of deleted monitors.
    pub fn update_metric_groups(&self, updates: &[MetricGroupUpdate]) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();

        for update in updates {
            // Edited in place so a concurrent credential refresh is not overwritten
            let group = match self.canonical.get_mut(&update.id) {
                Some(mut entry) => {
                    if let Some(interval) = update.polling_interval.filter(|i| *i > 0) {
                        entry.polling_interval = interval;
                    }
                    if let Some(enabled) = update.is_enabled {
                        entry.is_enabled = enabled;
                    }
                    entry.clone()
                }
                None => {
                    outcome.missing.push(update.id);
                    continue;
                }
            };

            if group.is_enabled {
                let monitor_id = group.monitor_id;
                self.live.insert(update.id, group);
                if self.deleted.contains(&monitor_id) {
                    self.evict(&[update.id]);
                    outcome.missing.push(update.id);
                    continue;
                }
                outcome.updated.push(update.id);
            } else {
                self.live.remove(&update.id);
                self.canonical.remove(&update.id);
                outcome.removed.push(update.id);
            }
        }

        outcome
    }

    /// Evict every group of a monitor and keep it from being cached again. Returns how many were
    /// removed.
    pub fn delete_groups_of_monitor(&self, monitor_id: MonitorId) -> usize {
        self.deleted.insert(monitor_id);
        self.live.retain(|_, g| g.monitor_id != monitor_id);
        let before = self.canonical.len();
        self.canonical.retain(|_, g| g.monitor_id != monitor_id);
        before.saturating_sub(self.canonical.len())
    }

    /// Swap in the current username and password for every group polled with `credential`.
    /// Countdowns are left alone. Returns how many groups were refreshed.
    pub fn refresh_credential(&self, credential: &Credential) -> usize {
        let blob = credential.plugin_blob();
        let mut refreshed = 0;
        for mut entry in self.canonical.iter_mut() {
            if entry.credential_id == credential.id {
                entry.credential = blob.clone();
                refreshed += 1;
            }
        }
        for mut entry in self.live.iter_mut() {
            if entry.credential_id == credential.id {
                entry.credential = blob.clone();
            }
        }
        refreshed
    }

    fn evict(&self, ids: &[MetricGroupId]) {
        for id in ids {
            self.live.remove(id);
            self.canonical.remove(id);
        }
    }

    /// Advance every countdown by `interval_secs` and return the groups that reached zero.
    ///
    /// Returned groups carry their configured interval, and their countdown is restarted from it.
    pub fn collect_timed_out_and_tick(&self, interval_secs: u32) -> Vec<CachedMetricGroup> {
        let mut due = Vec::new();
        let mut orphaned = Vec::new();

        for mut entry in self.live.iter_mut() {
            let remaining = entry.polling_interval.saturating_sub(interval_secs);
            if remaining > 0 {
                entry.polling_interval = remaining;
                continue;
            }

            let Some(configured) = self.canonical.get(entry.key()).map(|c| c.polling_interval) else {
                orphaned.push(*entry.key());
                continue;
            };

            entry.polling_interval = configured;
            due.push(entry.value().clone());
        }

        for id in orphaned {
            warn!("Dropping live countdown for metric group {} with no configured interval", id);
            self.live.remove(&id);
        }

        due
    }

    /// Number of cached groups.
    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    pub fn configured(&self, id: MetricGroupId) -> Option<CachedMetricGroup> {
        self.canonical.get(&id).map(|g| g.clone())
    }

    /// Seconds until the group is next due.
    pub fn countdown(&self, id: MetricGroupId) -> Option<u32> {
        self.live.get(&id).map(|g| g.polling_interval)
    }

    pub fn contains(&self, id: MetricGroupId) -> bool {
        self.canonical.contains_key(&id) || self.live.contains_key(&id)
    }
}
