use crate::db::{
    errors::Result,
    models::{
        credentials::Credential,
        monitors::{MetricGroup, MetricGroupUpdateDBRequest, Monitor, MonitorDBResponse, MonitorFilter},
    },
};
use crate::types::{DiscoveryId, MetricType, MonitorId};
use sqlx::{PgConnection, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

pub struct Monitors<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Monitors<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Attach credentials and metric groups to a set of monitor rows, preserving their order.
    async fn hydrate(&mut self, monitors: Vec<Monitor>) -> Result<Vec<MonitorDBResponse>> {
        if monitors.is_empty() {
            return Ok(Vec::new());
        }

        let monitor_ids: Vec<MonitorId> = monitors.iter().map(|m| m.id).collect();
        let credential_ids: Vec<i32> = monitors.iter().map(|m| m.credential_id).collect();

        let credentials: HashMap<i32, Credential> =
            sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE id = ANY($1)")
                .bind(&credential_ids)
                .fetch_all(&mut *self.db)
                .await?
                .into_iter()
                .map(|c| (c.id, c))
                .collect();

        let groups = sqlx::query_as::<_, MetricGroup>("SELECT * FROM metric_groups WHERE monitor_id = ANY($1) ORDER BY id")
            .bind(&monitor_ids)
            .fetch_all(&mut *self.db)
            .await?;

        let mut groups_by_monitor: HashMap<MonitorId, Vec<MetricGroup>> = HashMap::new();
        for group in groups {
            groups_by_monitor.entry(group.monitor_id).or_default().push(group);
        }

        let mut hydrated = Vec::with_capacity(monitors.len());
        for monitor in monitors {
            // credential_id is a RESTRICT foreign key, so the row is always there
            let Some(credential) = credentials.get(&monitor.credential_id).cloned() else {
                tracing::warn!("Monitor {} references missing credential {}", monitor.id, monitor.credential_id);
                continue;
            };
            let metric_groups = groups_by_monitor.remove(&monitor.id).unwrap_or_default();
            hydrated.push(MonitorDBResponse {
                monitor,
                credential,
                metric_groups,
            });
        }
        Ok(hydrated)
    }

    /// Create a monitor for every COMPLETED result of a discovery whose IP is not monitored yet,
    /// each with one metric group per [`MetricType`]. Returns the new monitors.
    #[instrument(skip(self), err)]
    pub async fn provision_from_discovery(&mut self, discovery_id: DiscoveryId, polling_interval: i32) -> Result<Vec<MonitorDBResponse>> {
        let names: Vec<String> = MetricType::ALL.iter().map(|t| t.as_str().to_string()).collect();

        let created = sqlx::query_as::<_, Monitor>(
            r#"
            WITH new_monitors AS (
                INSERT INTO monitors (ip, port, credential_id)
                SELECT dr.ip, d.port, dr.credential_id
                FROM discovery_results dr
                INNER JOIN discoveries d ON d.id = dr.discovery_id
                WHERE dr.discovery_id = $1
                  AND dr.status = 'COMPLETED'
                  AND dr.credential_id IS NOT NULL
                ORDER BY dr.ip
                ON CONFLICT (ip) DO NOTHING
                RETURNING *
            ),
            new_groups AS (
                INSERT INTO metric_groups (monitor_id, name, polling_interval)
                SELECT nm.id, g.name, $2
                FROM new_monitors nm
                CROSS JOIN UNNEST($3::varchar[]) AS g(name)
            )
            SELECT * FROM new_monitors ORDER BY id
            "#,
        )
        .bind(discovery_id)
        .bind(polling_interval)
        .bind(&names)
        .fetch_all(&mut *self.db)
        .await?;

        self.hydrate(created).await
    }

    #[instrument(skip(self), err)]
    pub async fn get(&mut self, id: MonitorId) -> Result<Option<MonitorDBResponse>> {
        let monitor = sqlx::query_as::<_, Monitor>("SELECT * FROM monitors WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        match monitor {
            Some(monitor) => Ok(self.hydrate(vec![monitor]).await?.pop()),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &MonitorFilter) -> Result<Vec<MonitorDBResponse>> {
        let mut query = QueryBuilder::new("SELECT * FROM monitors ORDER BY id LIMIT ");
        query.push_bind(filter.limit);
        query.push(" OFFSET ");
        query.push_bind(filter.skip);

        let monitors = query.build_query_as::<Monitor>().fetch_all(&mut *self.db).await?;
        self.hydrate(monitors).await
    }

    /// Every monitor with its groups. Used to warm the scheduling cache at startup.
    #[instrument(skip(self), err)]
    pub async fn list_all(&mut self) -> Result<Vec<MonitorDBResponse>> {
        let monitors = sqlx::query_as::<_, Monitor>("SELECT * FROM monitors ORDER BY id")
            .fetch_all(&mut *self.db)
            .await?;
        self.hydrate(monitors).await
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM monitors")
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    /// Delete a monitor. Its metric groups and polling results go with it.
    #[instrument(skip(self), err)]
    pub async fn delete(&mut self, id: MonitorId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM monitors WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Apply per-name changes to a monitor's metric groups. Fields left as `None` keep their
    /// stored value. Returns the rows that matched.
    #[instrument(skip(self, updates), fields(count = updates.len()), err)]
    pub async fn update_metric_groups(&mut self, monitor_id: MonitorId, updates: &[MetricGroupUpdateDBRequest]) -> Result<Vec<MetricGroup>> {
        let mut updated = Vec::with_capacity(updates.len());
        for update in updates {
            let group = sqlx::query_as::<_, MetricGroup>(
                r#"
                UPDATE metric_groups SET
                    polling_interval = COALESCE($3, polling_interval),
                    is_enabled = COALESCE($4, is_enabled)
                WHERE monitor_id = $1 AND name = $2
                RETURNING *
                "#,
            )
            .bind(monitor_id)
            .bind(update.name)
            .bind(update.polling_interval)
            .bind(update.is_enabled)
            .fetch_optional(&mut *self.db)
            .await?;

            if let Some(group) = group {
                updated.push(group);
            }
        }
        Ok(updated)
    }
}
