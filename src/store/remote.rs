use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::Document;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Stores a new document and returns the id the backend assigned.
    async fn insert(&self, collection: &str, data: &Document, now: DateTime<Utc>) -> StoreResult<String>;

    async fn list(&self, collection: &str) -> StoreResult<Vec<Document>>;

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;

    /// Merges `patch` into an existing document; a missing id is an error.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Document,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Document {
    let Json(mut data): Json<Document> = row.get("data");
    let id: String = row.get("id");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");
    data.insert("id".to_string(), Value::String(id));
    data.insert("createdAt".to_string(), Value::String(created_at.to_rfc3339()));
    data.insert("updatedAt".to_string(), Value::String(updated_at.to_rfc3339()));
    data
}

#[async_trait]
impl RemoteStore for PgDocumentStore {
    async fn insert(&self, collection: &str, data: &Document, now: DateTime<Utc>) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO quality_tracking.documents (collection, id, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(Json(data))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, data, created_at, updated_at FROM quality_tracking.documents \
             WHERE collection = $1 ORDER BY created_at",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, data, created_at, updated_at FROM quality_tracking.documents \
             WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_document))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Document,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE quality_tracking.documents
            SET data = data || $3, updated_at = $4
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Json(patch))
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM quality_tracking.documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
