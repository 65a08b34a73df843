//! Record store interface for environments

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::Environment;

/// Errors surfaced by a record store implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Environment not found: {0}")]
    NotFound(String),

    #[error("Invalid environment record: {0}")]
    InvalidRecord(String),
}

/// Durable key/value store holding environment records
///
/// The engine behind it is not the concern of this crate. Implement this to
/// back environments with a database or a file.
#[async_trait::async_trait]
pub trait EnvironmentStore: Send + Sync {
    /// Retrieve an environment by id
    async fn get(&self, id: &str) -> Result<Option<Environment>, StoreError>;

    /// Create or replace an environment record
    async fn put(&self, environment: Environment) -> Result<(), StoreError>;

    /// Delete an environment record; deleting a missing id is not an error
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// List every environment record
    async fn list(&self) -> Result<Vec<Environment>, StoreError>;
}

/// In-memory environment store
/// All data is lost when the process restarts.
#[derive(Clone, Default)]
pub struct InMemoryEnvironmentStore {
    records: Arc<RwLock<HashMap<String, Environment>>>,
}

impl InMemoryEnvironmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the given records
    pub fn with_environments(environments: impl IntoIterator<Item = Environment>) -> Self {
        let records = environments
            .into_iter()
            .map(|env| (env.id.clone(), env))
            .collect();
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }
}

#[async_trait::async_trait]
impl EnvironmentStore for InMemoryEnvironmentStore {
    async fn get(&self, id: &str) -> Result<Option<Environment>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, environment: Environment) -> Result<(), StoreError> {
        if environment.id.is_empty() {
            return Err(StoreError::InvalidRecord("empty identifier".to_string()));
        }
        self.records
            .write()
            .await
            .insert(environment.id.clone(), environment);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Environment>, StoreError> {
        let mut environments: Vec<_> = self.records.read().await.values().cloned().collect();
        environments.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(environments)
    }
}
