use crate::db::{
    errors::Result,
    models::polling_results::{NewPollingResult, PollingResult, PollingResultFilter},
};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, QueryBuilder};
use tracing::instrument;

pub struct PollingResults<'c> {
    db: &'c mut PgConnection,
}

impl<'c> PollingResults<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Append a batch of results in a single statement. Rows for monitors that no longer exist
    /// are skipped; the count of stored rows is returned.
    #[instrument(skip(self, results), fields(count = results.len()), err)]
    pub async fn insert_batch(&mut self, results: &[NewPollingResult]) -> Result<u64> {
        if results.is_empty() {
            return Ok(0);
        }

        let mut monitor_ids: Vec<i32> = Vec::with_capacity(results.len());
        let mut names: Vec<String> = Vec::with_capacity(results.len());
        let mut data: Vec<serde_json::Value> = Vec::with_capacity(results.len());
        let mut times: Vec<DateTime<Utc>> = Vec::with_capacity(results.len());

        for result in results {
            monitor_ids.push(result.monitor_id);
            names.push(result.name.as_str().to_string());
            data.push(result.data.clone());
            times.push(result.time);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO polling_results (monitor_id, name, data, time)
            SELECT u.monitor_id, u.name, u.data, u.time
            FROM UNNEST($1::int4[], $2::varchar[], $3::jsonb[], $4::timestamptz[]) AS u(monitor_id, name, data, time)
            JOIN monitors m ON m.id = u.monitor_id
            "#,
        )
        .bind(&monitor_ids)
        .bind(&names)
        .bind(&data)
        .bind(&times)
        .execute(&mut *self.db)
        .await?;

        Ok(inserted.rows_affected())
    }

    /// Newest first.
    #[instrument(skip(self, filter), fields(limit = filter.limit), err)]
    pub async fn list(&mut self, filter: &PollingResultFilter) -> Result<Vec<PollingResult>> {
        let mut query = QueryBuilder::new("SELECT * FROM polling_results WHERE 1=1");

        if let Some(monitor_id) = filter.monitor_id {
            query.push(" AND monitor_id = ");
            query.push_bind(monitor_id);
        }
        if let Some(name) = filter.name {
            query.push(" AND name = ");
            query.push_bind(name);
        }

        query.push(" ORDER BY time DESC, id DESC LIMIT ");
        query.push_bind(filter.limit);

        let results = query.build_query_as::<PollingResult>().fetch_all(&mut *self.db).await?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricType;
    use serde_json::json;
    use sqlx::PgPool;

    async fn seed_monitor(pool: &PgPool) -> i32 {
        let credential_id: i32 =
            sqlx::query_scalar("INSERT INTO credentials (name, username, password) VALUES ('c', 'u', 'p') RETURNING id")
                .fetch_one(pool)
                .await
                .unwrap();
        sqlx::query_scalar("INSERT INTO monitors (ip, port, credential_id) VALUES ('10.0.0.9', 22, $1) RETURNING id")
            .bind(credential_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn test_insert_batch_keeps_each_data_shape(pool: PgPool) {
        let monitor_id = seed_monitor(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = PollingResults::new(&mut conn);

        let now = Utc::now();
        let batch = vec![
            NewPollingResult {
                monitor_id,
                name: MetricType::Memory,
                data: json!({"total": 1024}),
                time: now,
            },
            NewPollingResult {
                monitor_id,
                name: MetricType::Disk,
                data: json!([{"mount": "/"}]),
                time: now,
            },
            NewPollingResult {
                monitor_id,
                name: MetricType::Uptime,
                data: json!("up 3 days"),
                time: now,
            },
        ];
        assert_eq!(repo.insert_batch(&batch).await.unwrap(), 3);
        assert_eq!(repo.insert_batch(&[]).await.unwrap(), 0);

        let disk = repo
            .list(&PollingResultFilter {
                monitor_id: Some(monitor_id),
                name: Some(MetricType::Disk),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(disk.len(), 1);
        assert_eq!(disk[0].data, json!([{"mount": "/"}]));

        let all = repo
            .list(&PollingResultFilter {
                monitor_id: None,
                name: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|r| r.data == json!("up 3 days")));
    }

    #[sqlx::test]
    async fn test_insert_batch_skips_deleted_monitors(pool: PgPool) {
        let monitor_id = seed_monitor(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = PollingResults::new(&mut conn);

        let now = Utc::now();
        let batch = vec![
            NewPollingResult {
                monitor_id,
                name: MetricType::Memory,
                data: json!({"total": 2048}),
                time: now,
            },
            NewPollingResult {
                monitor_id: monitor_id + 1000,
                name: MetricType::Memory,
                data: json!({"total": 1}),
                time: now,
            },
        ];
        assert_eq!(repo.insert_batch(&batch).await.unwrap(), 1);

        let stored = repo
            .list(&PollingResultFilter {
                monitor_id: None,
                name: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].monitor_id, monitor_id);
        assert_eq!(stored[0].data, json!({"total": 2048}));
    }
}
