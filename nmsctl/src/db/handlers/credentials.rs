use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::credentials::{Credential, CredentialCreateDBRequest, CredentialDBResponse, CredentialUpdateDBRequest},
};
use crate::types::CredentialId;
use sqlx::{PgConnection, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct CredentialFilter {
    pub skip: i64,
    pub limit: i64,
}

impl Default for CredentialFilter {
    fn default() -> Self {
        Self { skip: 0, limit: 100 }
    }
}

pub struct Credentials<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Credentials<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM credentials")
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    /// Ids from `ids` with no matching row.
    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    pub async fn missing(&mut self, ids: &[CredentialId]) -> Result<Vec<CredentialId>> {
        let found: Vec<CredentialId> = sqlx::query_scalar("SELECT id FROM credentials WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(ids.iter().copied().filter(|id| !found.contains(id)).collect())
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Credentials<'c> {
    type CreateRequest = CredentialCreateDBRequest;
    type UpdateRequest = CredentialUpdateDBRequest;
    type Response = CredentialDBResponse;
    type Id = CredentialId;
    type Filter = CredentialFilter;

    #[instrument(skip(self, request), fields(name = %request.name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let credential = sqlx::query_as::<_, Credential>(
            r#"
            INSERT INTO credentials (name, username, password)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(&request.name)
        .bind(&request.username)
        .bind(&request.password)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(credential)
    }

    #[instrument(skip(self), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let credential = sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(credential)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let credentials = sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(credentials.into_iter().map(|c| (c.id, c)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut query = QueryBuilder::new("SELECT * FROM credentials ORDER BY id LIMIT ");
        query.push_bind(filter.limit);
        query.push(" OFFSET ");
        query.push_bind(filter.skip);

        let credentials = query.build_query_as::<Credential>().fetch_all(&mut *self.db).await?;
        Ok(credentials)
    }

    #[instrument(skip(self), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let credential = sqlx::query_as::<_, Credential>(
            r#"
            UPDATE credentials SET
                name = COALESCE($2, name),
                username = COALESCE($3, username),
                password = COALESCE($4, password)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(request.name.as_deref())
        .bind(request.username.as_deref())
        .bind(request.password.as_deref())
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    fn request(name: &str) -> CredentialCreateDBRequest {
        CredentialCreateDBRequest {
            name: name.to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    #[sqlx::test]
    async fn test_create_get_update_delete(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Credentials::new(&mut conn);

        let created = repo.create(&request("lab")).await.unwrap();
        assert_eq!(created.name, "lab");

        let fetched = repo.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);

        let updated = repo
            .update(
                created.id,
                &CredentialUpdateDBRequest {
                    password: Some("rotated".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.password, "rotated");
        assert_eq!(updated.username, "admin");

        assert!(repo.delete(created.id).await.unwrap());
        assert!(repo.get_by_id(created.id).await.unwrap().is_none());
        assert!(!repo.delete(created.id).await.unwrap());
    }

    #[sqlx::test]
    async fn test_duplicate_name_is_unique_violation(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Credentials::new(&mut conn);

        repo.create(&request("dup")).await.unwrap();
        let err = repo.create(&request("dup")).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[sqlx::test]
    async fn test_update_missing_is_not_found(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Credentials::new(&mut conn);

        let err = repo.update(9999, &CredentialUpdateDBRequest::default()).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }

    #[sqlx::test]
    async fn test_missing_and_bulk(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Credentials::new(&mut conn);

        let a = repo.create(&request("a")).await.unwrap();
        let b = repo.create(&request("b")).await.unwrap();

        let missing = repo.missing(&[a.id, b.id, 4242]).await.unwrap();
        assert_eq!(missing, vec![4242]);

        let bulk = repo.get_bulk(vec![a.id, b.id]).await.unwrap();
        assert_eq!(bulk.len(), 2);
        assert_eq!(bulk[&b.id].name, "b");
        assert_eq!(repo.count().await.unwrap(), 2);
    }
}
