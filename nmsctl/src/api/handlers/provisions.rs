use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use tracing::{debug, info};

use crate::{
    AppState,
    api::models::{
        pagination::PaginatedResponse,
        provisions::{ListProvisionsQuery, MetricGroupResponse, MetricGroupUpdate, MonitorResponse, ProvisionCreate, validate_metric_group_updates},
    },
    cache::{self, MonitorCache},
    db::{
        handlers::{Discoveries, Monitors, Repository},
        models::monitors::{MetricGroup, MonitorDBResponse, MonitorFilter},
    },
    errors::{Error, Result},
    types::{DiscoveryStatus, MonitorId},
};

/// Turn every successful result of a finished discovery into a monitor and start polling it.
pub async fn create_provision(
    State(state): State<AppState>,
    Json(create): Json<ProvisionCreate>,
) -> Result<(StatusCode, Json<Vec<MonitorResponse>>)> {
    let id = create.discovery_id;
    if state.discovery.runs().is_running(id) {
        return Err(Error::Conflict {
            message: format!("Discovery {id} is running"),
        });
    }

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let discovery = Discoveries::new(&mut tx)
        .get_by_id(id)
        .await?
        .ok_or_else(|| Error::not_found("Discovery", id))?;
    if discovery.status == DiscoveryStatus::Pending {
        return Err(Error::Conflict {
            message: format!("Discovery {id} has not run yet"),
        });
    }

    let interval = state.config.provisioning.default_polling_interval_secs as i32;
    let monitors = Monitors::new(&mut tx).provision_from_discovery(id, interval).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    // Only committed monitors may reach the cache
    let cached = state.cache.insert_monitors(&monitors);
    info!("Provisioned {} monitors from discovery {} ({} metric groups scheduled)", monitors.len(), id, cached);

    Ok((StatusCode::CREATED, Json(monitors.into_iter().map(MonitorResponse::from).collect())))
}

pub async fn list_provisions(
    State(state): State<AppState>,
    Query(query): Query<ListProvisionsQuery>,
) -> Result<Json<PaginatedResponse<MonitorResponse>>> {
    let (skip, limit) = query.pagination.params();
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Monitors::new(&mut conn);

    let total_count = repo.count().await?;
    let monitors = repo.list(&MonitorFilter { skip, limit }).await?;

    Ok(Json(PaginatedResponse::new(
        monitors.into_iter().map(MonitorResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

pub async fn get_provision(State(state): State<AppState>, Path(id): Path<MonitorId>) -> Result<Json<MonitorResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    match Monitors::new(&mut conn).get(id).await? {
        Some(monitor) => Ok(Json(MonitorResponse::from(monitor))),
        None => Err(Error::not_found("Monitor", id)),
    }
}

pub async fn delete_provision(State(state): State<AppState>, Path(id): Path<MonitorId>) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if !Monitors::new(&mut conn).delete(id).await? {
        return Err(Error::not_found("Monitor", id));
    }

    let evicted = state.cache.delete_groups_of_monitor(id);
    debug!("Evicted {} metric groups of monitor {} from the cache", evicted, id);
    Ok(StatusCode::NO_CONTENT)
}

/// Change polling intervals and enablement by metric group name. The database is updated first;
/// the cache then mirrors whatever rows actually changed.
pub async fn update_metric_groups(
    State(state): State<AppState>,
    Path(id): Path<MonitorId>,
    Json(updates): Json<Vec<MetricGroupUpdate>>,
) -> Result<Json<Vec<MetricGroupResponse>>> {
    let requests = validate_metric_group_updates(updates)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Monitors::new(&mut tx);
    if repo.get(id).await?.is_none() {
        return Err(Error::not_found("Monitor", id));
    }
    let updated = repo.update_metric_groups(id, &requests).await?;
    let monitor = repo.get(id).await?.ok_or_else(|| Error::not_found("Monitor", id))?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    sync_metric_groups(&state.cache, &monitor, &updated);

    Ok(Json(monitor.metric_groups.into_iter().map(MetricGroupResponse::from).collect()))
}

/// Mirror committed metric group changes into the cache. `monitor` may already be stale; the
/// cache refuses groups of monitors deleted in the meantime.
fn sync_metric_groups(cache: &MonitorCache, monitor: &MonitorDBResponse, updated: &[MetricGroup]) {
    let cache_updates: Vec<cache::MetricGroupUpdate> = updated.iter().map(cache::MetricGroupUpdate::from).collect();
    let outcome = cache.update_metric_groups(&cache_updates);

    // Groups that were disabled are not cached; enabling them again starts a fresh countdown
    if !outcome.missing.is_empty() {
        let mut reenabled = monitor.clone();
        reenabled
            .metric_groups
            .retain(|g| g.is_enabled && outcome.missing.contains(&g.id));
        let inserted = cache.insert_monitors(std::slice::from_ref(&reenabled));
        debug!("Re-scheduled {} metric groups of monitor {}", inserted, monitor.monitor.id);
    }
}
