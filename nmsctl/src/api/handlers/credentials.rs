use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use tracing::debug;

use crate::{
    AppState,
    api::models::{
        credentials::{CredentialCreate, CredentialResponse, CredentialUpdate, ListCredentialsQuery},
        pagination::PaginatedResponse,
    },
    db::handlers::{Credentials, Repository, credentials::CredentialFilter},
    errors::{Error, Result},
    types::CredentialId,
};

pub async fn list_credentials(
    State(state): State<AppState>,
    Query(query): Query<ListCredentialsQuery>,
) -> Result<Json<PaginatedResponse<CredentialResponse>>> {
    let (skip, limit) = query.pagination.params();
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Credentials::new(&mut conn);

    let total_count = repo.count().await?;
    let credentials = repo.list(&CredentialFilter { skip, limit }).await?;

    Ok(Json(PaginatedResponse::new(
        credentials.into_iter().map(CredentialResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

pub async fn create_credential(
    State(state): State<AppState>,
    Json(create): Json<CredentialCreate>,
) -> Result<(StatusCode, Json<CredentialResponse>)> {
    let request = create.into_db_request()?;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let credential = Credentials::new(&mut conn).create(&request).await?;
    Ok((StatusCode::CREATED, Json(CredentialResponse::from(credential))))
}

pub async fn get_credential(State(state): State<AppState>, Path(id): Path<CredentialId>) -> Result<Json<CredentialResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    match Credentials::new(&mut conn).get_by_id(id).await? {
        Some(credential) => Ok(Json(CredentialResponse::from(credential))),
        None => Err(Error::not_found("Credential", id)),
    }
}

/// Monitors polled with this credential pick up the change on their next poll.
pub async fn update_credential(
    State(state): State<AppState>,
    Path(id): Path<CredentialId>,
    Json(update): Json<CredentialUpdate>,
) -> Result<Json<CredentialResponse>> {
    let request = update.into_db_request()?;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let credential = Credentials::new(&mut conn).update(id, &request).await?;

    let refreshed = state.cache.refresh_credential(&credential);
    debug!("Refreshed credential {} on {} cached metric groups", id, refreshed);
    Ok(Json(CredentialResponse::from(credential)))
}

/// Credentials still referenced by a discovery or monitor cannot be deleted.
pub async fn delete_credential(State(state): State<AppState>, Path(id): Path<CredentialId>) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if Credentials::new(&mut conn).delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found("Credential", id))
    }
}

#[cfg(test)]
mod tests {
    use crate::api::models::credentials::CredentialResponse;
    use crate::api::models::pagination::PaginatedResponse;
    use crate::api::models::provisions::MonitorResponse;
    use crate::test_utils::{create_test_app, create_test_server, wait_for_run};
    use crate::types::DiscoveryStatus;
    use serde_json::json;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_credential_lifecycle(pool: PgPool) {
        let (server, _bg) = create_test_server(pool).await;

        let response = server
            .post("/api/v1/credentials")
            .json(&json!({"name": "core-switches", "username": "netops", "password": "hunter2"}))
            .await;
        response.assert_status(axum::http::StatusCode::CREATED);
        let body: serde_json::Value = response.json();
        assert!(body.get("password").is_none());
        let id = body["id"].as_i64().unwrap();

        let response = server
            .patch(&format!("/api/v1/credentials/{id}"))
            .json(&json!({"username": "netadmin"}))
            .await;
        response.assert_status_ok();
        let updated: CredentialResponse = response.json();
        assert_eq!(updated.username, "netadmin");
        assert_eq!(updated.name, "core-switches");

        let page: PaginatedResponse<CredentialResponse> = server.get("/api/v1/credentials").await.json();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.limit, 10);

        server
            .delete(&format!("/api/v1/credentials/{id}"))
            .await
            .assert_status(axum::http::StatusCode::NO_CONTENT);
        server
            .get(&format!("/api/v1/credentials/{id}"))
            .await
            .assert_status_not_found();
    }

    #[sqlx::test]
    async fn test_update_reaches_cached_metric_groups(pool: PgPool) {
        let (server, state, _bg) = create_test_app(pool).await;
        let cred: serde_json::Value = server
            .post("/api/v1/credentials")
            .json(&json!({"name": "lab", "username": "root", "password": "secret"}))
            .await
            .json();
        let discovery: serde_json::Value = server
            .post("/api/v1/discoveries")
            .json(&json!({"name": "lab", "ip": "192.0.2.1", "ip_type": "SINGLE", "port": 22, "credential_ids": [cred["id"]]}))
            .await
            .json();
        let discovery_id = discovery["id"].as_i64().unwrap() as i32;
        server
            .post(&format!("/api/v1/discoveries/{discovery_id}/run"))
            .await
            .assert_status(axum::http::StatusCode::ACCEPTED);
        assert_eq!(wait_for_run(&state, discovery_id).await, DiscoveryStatus::Completed);

        let monitors: Vec<MonitorResponse> = server
            .post("/api/v1/provisions")
            .json(&json!({"discovery_id": discovery_id}))
            .await
            .json();
        let group_id = monitors[0].metric_groups[0].id;
        assert_eq!(state.cache.configured(group_id).unwrap().credential["password"], "secret");

        server
            .patch(&format!("/api/v1/credentials/{}", cred["id"]))
            .json(&json!({"password": "rotated"}))
            .await
            .assert_status_ok();

        let cached = state.cache.configured(group_id).unwrap();
        assert_eq!(cached.credential["password"], "rotated");
        assert_eq!(cached.credential["username"], "root");
    }

    #[sqlx::test]
    async fn test_duplicate_and_blank_names_rejected(pool: PgPool) {
        let (server, _bg) = create_test_server(pool).await;
        let body = json!({"name": "lab", "username": "root", "password": "x"});

        server.post("/api/v1/credentials").json(&body).await.assert_status(axum::http::StatusCode::CREATED);
        let response = server.post("/api/v1/credentials").json(&body).await;
        response.assert_status(axum::http::StatusCode::CONFLICT);
        assert_eq!(response.json::<serde_json::Value>()["message"], "A credential with this name already exists");

        server
            .post("/api/v1/credentials")
            .json(&json!({"name": "  ", "username": "root", "password": "x"}))
            .await
            .assert_status_bad_request();
    }
}
