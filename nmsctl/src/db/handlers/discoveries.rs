use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::{
        credentials::Credential,
        discoveries::{
            Discovery, DiscoveryCreateDBRequest, DiscoveryDBResponse, DiscoveryFilter, DiscoveryResult, DiscoveryUpdateDBRequest,
            NewDiscoveryResult,
        },
    },
};
use crate::types::{CredentialId, DiscoveryId, DiscoveryStatus, ResultStatus};
use sqlx::{FromRow, PgConnection, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

pub struct Discoveries<'c> {
    db: &'c mut PgConnection,
}

#[derive(FromRow)]
struct CredentialLink {
    discovery_id: DiscoveryId,
    credential_id: CredentialId,
}

impl<'c> Discoveries<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    async fn credential_links(&mut self, ids: &[DiscoveryId]) -> Result<HashMap<DiscoveryId, Vec<CredentialId>>> {
        let links = sqlx::query_as::<_, CredentialLink>(
            "SELECT discovery_id, credential_id FROM discovery_credentials WHERE discovery_id = ANY($1) ORDER BY credential_id",
        )
        .bind(ids)
        .fetch_all(&mut *self.db)
        .await?;

        let mut by_discovery: HashMap<DiscoveryId, Vec<CredentialId>> = HashMap::new();
        for link in links {
            by_discovery.entry(link.discovery_id).or_default().push(link.credential_id);
        }
        Ok(by_discovery)
    }

    /// Replace the candidate credential set of a discovery.
    #[instrument(skip(self, credential_ids), fields(count = credential_ids.len()), err)]
    pub async fn replace_credentials(&mut self, id: DiscoveryId, credential_ids: &[CredentialId]) -> Result<()> {
        sqlx::query("DELETE FROM discovery_credentials WHERE discovery_id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO discovery_credentials (discovery_id, credential_id)
            SELECT $1::int4, c FROM UNNEST($2::int4[]) AS c
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id)
        .bind(credential_ids)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Full credential rows attached to a discovery, in id order.
    #[instrument(skip(self), err)]
    pub async fn credentials(&mut self, id: DiscoveryId) -> Result<Vec<Credential>> {
        let credentials = sqlx::query_as::<_, Credential>(
            r#"
            SELECT c.* FROM credentials c
            INNER JOIN discovery_credentials dc ON dc.credential_id = c.id
            WHERE dc.discovery_id = $1
            ORDER BY c.id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(credentials)
    }

    #[instrument(skip(self), err)]
    pub async fn set_status(&mut self, id: DiscoveryId, status: DiscoveryStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE discoveries SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every result of a previous run.
    #[instrument(skip(self), err)]
    pub async fn clear_results(&mut self, id: DiscoveryId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM discovery_results WHERE discovery_id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Insert a batch of results in one statement. Rows for an `(id, ip)` pair that already
    /// exists are left as they are.
    #[instrument(skip(self, results), fields(count = results.len()), err)]
    pub async fn insert_results(&mut self, id: DiscoveryId, results: &[NewDiscoveryResult]) -> Result<u64> {
        if results.is_empty() {
            return Ok(0);
        }

        let mut credential_ids: Vec<Option<CredentialId>> = Vec::with_capacity(results.len());
        let mut ips: Vec<String> = Vec::with_capacity(results.len());
        let mut messages: Vec<String> = Vec::with_capacity(results.len());
        let mut statuses: Vec<String> = Vec::with_capacity(results.len());

        for result in results {
            credential_ids.push(result.credential_id);
            ips.push(result.ip.clone());
            messages.push(result.message.clone());
            statuses.push(status_label(result.status).to_string());
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO discovery_results (discovery_id, credential_id, ip, message, status)
            SELECT $1::int4, * FROM UNNEST($2::int4[], $3::varchar[], $4::text[], $5::varchar[])
            ON CONFLICT (discovery_id, ip) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&credential_ids)
        .bind(&ips)
        .bind(&messages)
        .bind(&statuses)
        .execute(&mut *self.db)
        .await?;

        Ok(inserted.rows_affected())
    }

    #[instrument(skip(self), err)]
    pub async fn list_results(&mut self, id: DiscoveryId) -> Result<Vec<DiscoveryResult>> {
        let results = sqlx::query_as::<_, DiscoveryResult>(
            "SELECT * FROM discovery_results WHERE discovery_id = $1 ORDER BY ip",
        )
        .bind(id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(results)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &DiscoveryFilter) -> Result<i64> {
        let mut query = QueryBuilder::new("SELECT COUNT(*) FROM discoveries WHERE 1=1");
        if let Some(status) = filter.status {
            query.push(" AND status = ");
            query.push_bind(status);
        }
        let count: i64 = query.build_query_scalar().fetch_one(&mut *self.db).await?;
        Ok(count)
    }
}

fn status_label(status: ResultStatus) -> &'static str {
    match status {
        ResultStatus::Completed => "COMPLETED",
        ResultStatus::Failed => "FAILED",
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Discoveries<'c> {
    type CreateRequest = DiscoveryCreateDBRequest;
    type UpdateRequest = DiscoveryUpdateDBRequest;
    type Response = DiscoveryDBResponse;
    type Id = DiscoveryId;
    type Filter = DiscoveryFilter;

    #[instrument(skip(self, request), fields(name = %request.name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let discovery = sqlx::query_as::<_, Discovery>(
            r#"
            INSERT INTO discoveries (name, ip, ip_type, port)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&request.name)
        .bind(&request.ip)
        .bind(request.ip_type)
        .bind(request.port)
        .fetch_one(&mut *self.db)
        .await?;

        self.replace_credentials(discovery.id, &request.credential_ids).await?;

        let mut credential_ids = request.credential_ids.clone();
        credential_ids.sort_unstable();
        credential_ids.dedup();
        Ok(DiscoveryDBResponse::from_parts(discovery, credential_ids))
    }

    #[instrument(skip(self), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let Some(discovery) = sqlx::query_as::<_, Discovery>("SELECT * FROM discoveries WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?
        else {
            return Ok(None);
        };

        let mut links = self.credential_links(&[id]).await?;
        let credential_ids = links.remove(&id).unwrap_or_default();
        Ok(Some(DiscoveryDBResponse::from_parts(discovery, credential_ids)))
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let discoveries = sqlx::query_as::<_, Discovery>("SELECT * FROM discoveries WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        let mut links = self.credential_links(&ids).await?;

        Ok(discoveries
            .into_iter()
            .map(|d| {
                let credential_ids = links.remove(&d.id).unwrap_or_default();
                (d.id, DiscoveryDBResponse::from_parts(d, credential_ids))
            })
            .collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut query = QueryBuilder::new("SELECT * FROM discoveries WHERE 1=1");
        if let Some(status) = filter.status {
            query.push(" AND status = ");
            query.push_bind(status);
        }
        query.push(" ORDER BY id LIMIT ");
        query.push_bind(filter.limit);
        query.push(" OFFSET ");
        query.push_bind(filter.skip);

        let discoveries = query.build_query_as::<Discovery>().fetch_all(&mut *self.db).await?;
        let ids: Vec<DiscoveryId> = discoveries.iter().map(|d| d.id).collect();
        let mut links = self.credential_links(&ids).await?;

        Ok(discoveries
            .into_iter()
            .map(|d| {
                let credential_ids = links.remove(&d.id).unwrap_or_default();
                DiscoveryDBResponse::from_parts(d, credential_ids)
            })
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM discoveries WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Only discoveries that have never run can be edited.
    #[instrument(skip(self, request), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let updated = sqlx::query_as::<_, Discovery>(
            r#"
            UPDATE discoveries SET
                name = COALESCE($2, name),
                ip = COALESCE($3, ip),
                ip_type = COALESCE($4, ip_type),
                port = COALESCE($5, port),
                updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(request.name.as_deref())
        .bind(request.ip.as_deref())
        .bind(request.ip_type)
        .bind(request.port)
        .fetch_optional(&mut *self.db)
        .await?;

        let Some(discovery) = updated else {
            let status: Option<DiscoveryStatus> = sqlx::query_scalar("SELECT status FROM discoveries WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
            return Err(match status {
                None => DbError::NotFound,
                Some(status) => DbError::InvalidState {
                    entity: "Discovery",
                    id: id.to_string(),
                    reason: format!("status is {status}, only PENDING discoveries can be updated"),
                },
            });
        };

        if let Some(credential_ids) = &request.credential_ids {
            self.replace_credentials(id, credential_ids).await?;
        }

        let mut links = self.credential_links(&[id]).await?;
        let credential_ids = links.remove(&id).unwrap_or_default();
        Ok(DiscoveryDBResponse::from_parts(discovery, credential_ids))
    }
}
