//! Cached environment view and liveness writer

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::model::{Environment, EnvironmentStatus};
use crate::store::{EnvironmentStore, StoreError};

/// Outcome of a liveness write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub environment_id: String,
    pub previous: EnvironmentStatus,
    pub current: EnvironmentStatus,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn is_transition(&self) -> bool {
        self.previous != self.current
    }
}

/// Read-mostly view of the environment records
///
/// Status writes are serialized per environment id, so concurrent writers
/// for one environment are applied one after the other while unrelated
/// environments never contend.
pub struct EnvironmentRegistry {
    store: Arc<dyn EnvironmentStore>,
    cache: DashMap<String, Environment>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    changes: broadcast::Sender<StatusChange>,
}

impl EnvironmentRegistry {
    pub fn new(store: Arc<dyn EnvironmentStore>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            store,
            cache: DashMap::new(),
            locks: DashMap::new(),
            changes,
        }
    }

    /// Subscribe to status transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Reload the cached view from the store
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let environments = self.store.list().await?;
        self.cache.clear();
        for env in &environments {
            self.cache.insert(env.id.clone(), env.clone());
        }
        debug!("Environment cache refreshed ({} records)", environments.len());
        Ok(environments.len())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Environment>, StoreError> {
        if let Some(env) = self.cache.get(id) {
            return Ok(Some(env.clone()));
        }

        let env = self.store.get(id).await?;
        if let Some(env) = &env {
            self.cache.insert(id.to_string(), env.clone());
        }
        Ok(env)
    }

    /// Cached record only, without touching the store
    pub fn get_cached(&self, id: &str) -> Option<Environment> {
        self.cache.get(id).map(|env| env.clone())
    }

    pub async fn list(&self) -> Result<Vec<Environment>, StoreError> {
        let environments = self.store.list().await?;
        for env in &environments {
            self.cache.insert(env.id.clone(), env.clone());
        }
        Ok(environments)
    }

    /// Create or update an environment's configuration
    ///
    /// Liveness fields of an existing record are kept; only this registry
    /// writes them.
    pub async fn save(&self, mut environment: Environment) -> Result<(), StoreError> {
        let lock = self.lock_for(&environment.id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.get(&environment.id).await? {
            environment.status = existing.status;
            environment.last_probe_at = existing.last_probe_at;
            environment.status_changed_at = existing.status_changed_at;
        }

        self.store.put(environment.clone()).await?;
        self.cache.insert(environment.id.clone(), environment);
        Ok(())
    }

    /// Remove an environment, returning the deleted record
    pub async fn delete(&self, id: &str) -> Result<Option<Environment>, StoreError> {
        let lock = self.lock_for(id);
        let removed = {
            let _guard = lock.lock().await;
            let existing = self.store.get(id).await?;
            self.store.delete(id).await?;
            self.cache.remove(id);
            // Writers already waiting hold a clone; they must keep sharing this lock
            self.locks.remove_if(id, |_, entry| Arc::strong_count(entry) <= 2);
            existing
        };

        if removed.is_some() {
            info!(environment_id = %id, "Environment deleted");
        }
        Ok(removed)
    }

    /// Set the status of an environment
    ///
    /// Returns `None` when the environment no longer exists.
    pub async fn set_status(
        &self,
        id: &str,
        status: EnvironmentStatus,
    ) -> Result<Option<StatusChange>, StoreError> {
        self.update(id, false, |_| status).await
    }

    /// Conditionally change the status of an environment
    ///
    /// `decide` runs under the environment's write lock with the current
    /// status; returning it unchanged leaves the record untouched.
    pub async fn update_status<F>(&self, id: &str, decide: F) -> Result<Option<StatusChange>, StoreError>
    where
        F: FnOnce(EnvironmentStatus) -> EnvironmentStatus + Send,
    {
        self.update(id, false, decide).await
    }

    /// Record a probe result
    ///
    /// `decide` receives the status held at the moment the write lock is taken
    /// and returns the new status. The probe timestamp is always recorded.
    pub async fn record_probe<F>(&self, id: &str, decide: F) -> Result<Option<StatusChange>, StoreError>
    where
        F: FnOnce(EnvironmentStatus) -> EnvironmentStatus + Send,
    {
        self.update(id, true, decide).await
    }

    async fn update<F>(
        &self,
        id: &str,
        probed: bool,
        decide: F,
    ) -> Result<Option<StatusChange>, StoreError>
    where
        F: FnOnce(EnvironmentStatus) -> EnvironmentStatus + Send,
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut env) = self.store.get(id).await? else {
            self.cache.remove(id);
            return Ok(None);
        };

        let now = Utc::now();
        let previous = env.status;
        let current = decide(previous);

        if probed {
            env.last_probe_at = Some(now);
        }
        if current != previous {
            env.status = current;
            env.status_changed_at = Some(now);
        }

        if probed || current != previous {
            self.store.put(env.clone()).await?;
        }
        self.cache.insert(id.to_string(), env);

        let change = StatusChange {
            environment_id: id.to_string(),
            previous,
            current,
            at: now,
        };

        if change.is_transition() {
            info!(
                environment_id = %id,
                previous = %previous,
                current = %current,
                "Environment status changed"
            );
            // No subscribers is fine
            let _ = self.changes.send(change.clone());
        }

        Ok(Some(change))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
