use axum::{
    extract::{Query, State},
    response::Json,
};

use crate::{
    AppState,
    api::models::polling_results::{ListPollingResultsQuery, PollingResultResponse},
    db::{handlers::PollingResults, models::polling_results::PollingResultFilter},
    errors::{Error, Result},
};

/// Most recent polling output first.
pub async fn list_polling_results(
    State(state): State<AppState>,
    Query(query): Query<ListPollingResultsQuery>,
) -> Result<Json<Vec<PollingResultResponse>>> {
    let filter = PollingResultFilter {
        monitor_id: query.monitor_id,
        name: query.name,
        limit: query.limit(),
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let results = PollingResults::new(&mut conn).list(&filter).await?;
    Ok(Json(results.into_iter().map(PollingResultResponse::from).collect()))
}

#[cfg(test)]
mod tests {
    use crate::api::models::polling_results::PollingResultResponse;
    use crate::db::handlers::{Credentials, Monitors, PollingResults, Repository};
    use crate::db::models::{credentials::CredentialCreateDBRequest, polling_results::NewPollingResult};
    use crate::test_utils::create_test_server;
    use crate::types::MetricType;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use sqlx::PgPool;

    #[sqlx::test]
    async fn test_list_filters_and_orders(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let credential = Credentials::new(&mut conn)
            .create(&CredentialCreateDBRequest {
                name: "lab".to_string(),
                username: "root".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();
        let monitor_id: i32 = sqlx::query_scalar("INSERT INTO monitors (ip, port, credential_id) VALUES ('192.0.2.10', 22, $1) RETURNING id")
            .bind(credential.id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert!(Monitors::new(&mut conn).get(monitor_id).await.unwrap().is_some());

        let now = Utc::now();
        let rows: Vec<NewPollingResult> = (0..3)
            .map(|i| NewPollingResult {
                monitor_id,
                name: if i == 1 { MetricType::Disk } else { MetricType::Uptime },
                data: json!({"sample": i}),
                time: now + Duration::seconds(i),
            })
            .collect();
        PollingResults::new(&mut conn).insert_batch(&rows).await.unwrap();
        drop(conn);

        let (server, _bg) = create_test_server(pool).await;

        let all: Vec<PollingResultResponse> = server.get("/api/v1/polling-results").await.json();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].data, json!({"sample": 2}));

        let uptime: Vec<PollingResultResponse> = server
            .get(&format!("/api/v1/polling-results?monitor_id={monitor_id}&name=UPTIME&limit=1"))
            .await
            .json();
        assert_eq!(uptime.len(), 1);
        assert_eq!(uptime[0].name, MetricType::Uptime);
        assert_eq!(uptime[0].data, json!({"sample": 2}));
    }
}
