//! Path-addressed document store.
//!
//! Sessions and users live in an opaque key/value document store addressed by
//! paths such as `sessions/<id>` and `users/<id>`. The trait keeps the auth
//! core independent of the backing engine: production runs against Postgres
//! (JSONB documents, see [`postgres`]), tests against [`MemoryStore`].

pub mod postgres;
pub mod users;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

pub use postgres::PgDocumentStore;
pub use users::{NewUser, User, UserRepo};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, path: &str, doc: Value) -> Result<(), StoreError>;

    /// Merges the top-level fields of `partial` into the document at `path`,
    /// creating the document if it does not exist.
    async fn update(&self, path: &str, partial: Value) -> Result<(), StoreError>;

    /// Removing an absent document is not an error.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Returns the first document in `collection` whose top-level `field`
    /// equals `value`, along with its id (the path segment after the
    /// collection prefix).
    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<(String, Value)>, StoreError>;
}

/// In-memory store used by the test suites.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.docs.read().await.get(path).cloned())
    }

    async fn set(&self, path: &str, doc: Value) -> Result<(), StoreError> {
        self.docs.write().await.insert(path.to_string(), doc);
        Ok(())
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let entry = docs
            .entry(path.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        match (entry.as_object_mut(), partial.as_object()) {
            (Some(doc), Some(fields)) => {
                for (k, v) in fields {
                    doc.insert(k.clone(), v.clone());
                }
                Ok(())
            }
            _ => Err(StoreError::Malformed {
                path: path.to_string(),
                detail: "update requires JSON objects".to_string(),
            }),
        }
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.docs.write().await.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.docs.read().await.contains_key(path))
    }

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<(String, Value)>, StoreError> {
        let prefix = format!("{}/", collection);
        let docs = self.docs.read().await;
        for (path, doc) in docs.range(prefix.clone()..) {
            if !path.starts_with(&prefix) {
                break;
            }
            if doc.get(field).and_then(Value::as_str) == Some(value) {
                let id = path[prefix.len()..].to_string();
                return Ok(Some((id, doc.clone())));
            }
        }
        Ok(None)
    }
}
