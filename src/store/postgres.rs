//! Postgres-backed document store.
//!
//! Documents live in a single table:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS documents (
//!     path        TEXT PRIMARY KEY,
//!     doc         JSONB NOT NULL,
//!     updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```

use crate::error::StoreError;
use crate::store::DocumentStore;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;

pub struct PgDocumentStore {
    pool: Arc<PgPool>,
}

impl PgDocumentStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                doc JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT doc FROM documents WHERE path = $1")
            .bind(path)
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(row.map(|r| r.get::<Value, _>("doc")))
    }

    async fn set(&self, path: &str, doc: Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO documents (path, doc, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (path) DO UPDATE SET doc = EXCLUDED.doc, updated_at = now()",
        )
        .bind(path)
        .bind(doc)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), StoreError> {
        // `||` merges top-level JSONB fields, matching MemoryStore::update.
        let result = sqlx::query(
            "UPDATE documents SET doc = doc || $2, updated_at = now() WHERE path = $1",
        )
        .bind(path)
        .bind(&partial)
        .execute(self.pool.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            self.set(path, partial).await?;
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM documents WHERE path = $1")
            .bind(path)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM documents WHERE path = $1) AS present")
            .bind(path)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(row.get::<bool, _>("present"))
    }

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<(String, Value)>, StoreError> {
        let prefix = format!("{}/", collection);
        let row = sqlx::query(
            "SELECT path, doc FROM documents
             WHERE path LIKE $1 || '%' AND doc->>$2 = $3
             LIMIT 1",
        )
        .bind(&prefix)
        .bind(field)
        .bind(value)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(|r| {
            let path: String = r.get("path");
            let id = path[prefix.len()..].to_string();
            (id, r.get::<Value, _>("doc"))
        }))
    }
}
