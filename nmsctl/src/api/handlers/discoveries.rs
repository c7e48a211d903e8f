use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use tracing::info;

use crate::{
    AppState,
    api::models::{
        discoveries::{
            DiscoveryCreate, DiscoveryResponse, DiscoveryResultResponse, DiscoveryRunAccepted, DiscoveryUpdate, ListDiscoveriesQuery,
            validate_credential_ids, validate_target,
        },
        pagination::PaginatedResponse,
    },
    db::{
        handlers::{Credentials, Discoveries, Repository},
        models::discoveries::{DiscoveryCreateDBRequest, DiscoveryFilter, DiscoveryUpdateDBRequest},
    },
    errors::{Error, Result},
    types::{CredentialId, DiscoveryId, DiscoveryStatus},
};

async fn ensure_credentials_exist(conn: &mut sqlx::PgConnection, ids: &[CredentialId]) -> Result<()> {
    let missing = Credentials::new(conn).missing(ids).await?;
    if !missing.is_empty() {
        return Err(Error::BadRequest {
            message: format!("unknown credential ids: {missing:?}"),
        });
    }
    Ok(())
}

pub async fn list_discoveries(
    State(state): State<AppState>,
    Query(query): Query<ListDiscoveriesQuery>,
) -> Result<Json<PaginatedResponse<DiscoveryResponse>>> {
    let (skip, limit) = query.pagination.params();
    let filter = DiscoveryFilter {
        skip,
        limit,
        status: query.status,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Discoveries::new(&mut conn);
    let total_count = repo.count(&filter).await?;
    let discoveries = repo.list(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        discoveries.into_iter().map(DiscoveryResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

pub async fn create_discovery(
    State(state): State<AppState>,
    Json(create): Json<DiscoveryCreate>,
) -> Result<(StatusCode, Json<DiscoveryResponse>)> {
    if create.name.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "name must not be empty".to_string(),
        });
    }
    validate_target(&create.ip, create.ip_type, create.port, state.config.discovery.max_ip_count)?;
    validate_credential_ids(&create.credential_ids)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    ensure_credentials_exist(&mut tx, &create.credential_ids).await?;

    let discovery = Discoveries::new(&mut tx)
        .create(&DiscoveryCreateDBRequest {
            name: create.name.trim().to_string(),
            ip: create.ip.trim().to_string(),
            ip_type: create.ip_type,
            port: create.port,
            credential_ids: create.credential_ids,
        })
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok((StatusCode::CREATED, Json(DiscoveryResponse::from(discovery))))
}

pub async fn get_discovery(State(state): State<AppState>, Path(id): Path<DiscoveryId>) -> Result<Json<DiscoveryResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    match Discoveries::new(&mut conn).get_by_id(id).await? {
        Some(discovery) => Ok(Json(DiscoveryResponse::from(discovery))),
        None => Err(Error::not_found("Discovery", id)),
    }
}

/// Only discoveries that have never run can be edited.
pub async fn update_discovery(
    State(state): State<AppState>,
    Path(id): Path<DiscoveryId>,
    Json(update): Json<DiscoveryUpdate>,
) -> Result<Json<DiscoveryResponse>> {
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    let current = Discoveries::new(&mut tx)
        .get_by_id(id)
        .await?
        .ok_or_else(|| Error::not_found("Discovery", id))?;
    if current.status != DiscoveryStatus::Pending {
        return Err(Error::Conflict {
            message: format!("Discovery {id} has status {}, only PENDING discoveries can be updated", current.status),
        });
    }

    if let Some(name) = &update.name
        && name.trim().is_empty()
    {
        return Err(Error::BadRequest {
            message: "name must not be empty".to_string(),
        });
    }

    // The new target has to make sense as a whole, not just the fields that changed
    let ip = update.ip.as_deref().unwrap_or(&current.ip);
    let ip_type = update.ip_type.unwrap_or(current.ip_type);
    let port = update.port.unwrap_or(current.port);
    validate_target(ip, ip_type, port, state.config.discovery.max_ip_count)?;

    if let Some(credential_ids) = &update.credential_ids {
        validate_credential_ids(credential_ids)?;
        ensure_credentials_exist(&mut tx, credential_ids).await?;
    }

    let discovery = Discoveries::new(&mut tx)
        .update(
            id,
            &DiscoveryUpdateDBRequest {
                name: update.name.map(|n| n.trim().to_string()),
                ip: update.ip.map(|ip| ip.trim().to_string()),
                ip_type: update.ip_type,
                port: update.port,
                credential_ids: update.credential_ids,
            },
        )
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(DiscoveryResponse::from(discovery)))
}

pub async fn delete_discovery(State(state): State<AppState>, Path(id): Path<DiscoveryId>) -> Result<StatusCode> {
    if state.discovery.runs().is_running(id) {
        return Err(Error::Conflict {
            message: format!("Discovery {id} is running"),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if Discoveries::new(&mut conn).delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found("Discovery", id))
    }
}

/// Start a pipeline run in the background. Progress is visible through the discovery's status
/// and its results.
pub async fn run_discovery(
    State(state): State<AppState>,
    Path(id): Path<DiscoveryId>,
) -> Result<(StatusCode, Json<DiscoveryRunAccepted>)> {
    {
        let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
        if Discoveries::new(&mut conn).get_by_id(id).await?.is_none() {
            return Err(Error::not_found("Discovery", id));
        }
    }

    // The spawned task owns the run; its outcome is recorded in the database
    let _handle = state.discovery.spawn(id)?;
    info!("Started discovery run {}", id);

    Ok((
        StatusCode::ACCEPTED,
        Json(DiscoveryRunAccepted {
            discovery_id: id,
            message: "Discovery run started".to_string(),
        }),
    ))
}

pub async fn list_discovery_results(
    State(state): State<AppState>,
    Path(id): Path<DiscoveryId>,
) -> Result<Json<Vec<DiscoveryResultResponse>>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Discoveries::new(&mut conn);
    if repo.get_by_id(id).await?.is_none() {
        return Err(Error::not_found("Discovery", id));
    }

    let results = repo.list_results(id).await?;
    Ok(Json(results.into_iter().map(DiscoveryResultResponse::from).collect()))
}
