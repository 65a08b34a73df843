//! Cache of forwarding handlers
//!
//! Handlers are keyed by environment id and checked against the configuration
//! fingerprint on every lookup. A stale or missing entry is rebuilt under a
//! per-environment lock, so concurrent callers wait for one build and share
//! its result.

use dashmap::DashMap;
use edgegate_environment::Environment;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::handler::ProxyHandler;
use crate::transport::TransportBuilder;

struct CacheEntry {
    handler: Arc<ProxyHandler>,
    leases: AtomicUsize,
    /// Milliseconds since the factory epoch
    last_used_ms: AtomicU64,
}

/// In-flight use of a cached handler
///
/// Entries with outstanding leases are never evicted for idleness.
pub struct HandlerLease {
    entry: Arc<CacheEntry>,
    epoch: Instant,
}

impl HandlerLease {
    fn new(entry: Arc<CacheEntry>, epoch: Instant) -> Self {
        entry.leases.fetch_add(1, Ordering::SeqCst);
        entry.last_used_ms.store(millis_since(epoch), Ordering::SeqCst);
        Self { entry, epoch }
    }

    pub fn handler(&self) -> &Arc<ProxyHandler> {
        &self.entry.handler
    }
}

impl Deref for HandlerLease {
    type Target = ProxyHandler;

    fn deref(&self) -> &ProxyHandler {
        &self.entry.handler
    }
}

impl Clone for HandlerLease {
    fn clone(&self) -> Self {
        Self::new(self.entry.clone(), self.epoch)
    }
}

impl Drop for HandlerLease {
    fn drop(&mut self) {
        self.entry
            .last_used_ms
            .store(millis_since(self.epoch), Ordering::SeqCst);
        self.entry.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for HandlerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerLease")
            .field("environment_id", &self.entry.handler.environment_id())
            .field("build_id", &self.entry.handler.build_id())
            .finish()
    }
}

fn millis_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

pub struct ProxyFactory {
    builder: TransportBuilder,
    dial_timeout: Duration,
    idle_period: Duration,
    entries: DashMap<String, Arc<CacheEntry>>,
    build_locks: DashMap<String, Arc<Mutex<()>>>,
    builds: AtomicU64,
    epoch: Instant,
}

impl ProxyFactory {
    pub fn new(builder: TransportBuilder, dial_timeout: Duration, idle_period: Duration) -> Self {
        Self {
            builder,
            dial_timeout,
            idle_period,
            entries: DashMap::new(),
            build_locks: DashMap::new(),
            builds: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Handler for the environment's current configuration
    pub async fn get_handler(&self, env: &Environment) -> Result<HandlerLease, ProxyError> {
        let fingerprint = env.fingerprint();
        if let Some(lease) = self.cached(&env.id, &fingerprint) {
            return Ok(lease);
        }

        let lock = self
            .build_locks
            .entry(env.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have finished the build while we waited
        if let Some(lease) = self.cached(&env.id, &fingerprint) {
            return Ok(lease);
        }

        let transport = self.builder.build(env)?;
        let build_id = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        let handler = ProxyHandler::new(env, transport, self.dial_timeout, build_id)?;

        info!(
            environment_id = %env.id,
            transport = handler.transport().name(),
            build_id,
            "Built proxy handler"
        );

        let entry = Arc::new(CacheEntry {
            handler: Arc::new(handler),
            leases: AtomicUsize::new(0),
            last_used_ms: AtomicU64::new(millis_since(self.epoch)),
        });
        let lease = HandlerLease::new(entry.clone(), self.epoch);
        self.entries.insert(env.id.clone(), entry);
        Ok(lease)
    }

    fn cached(&self, environment_id: &str, fingerprint: &str) -> Option<HandlerLease> {
        let entry = self.entries.get(environment_id)?;
        if entry.handler.fingerprint() != fingerprint {
            return None;
        }
        Some(HandlerLease::new(entry.clone(), self.epoch))
    }

    /// Drop the cached handler of an environment
    ///
    /// Calls holding a lease finish on the handler they started with.
    pub fn invalidate(&self, environment_id: &str) -> bool {
        let removed = self.entries.remove(environment_id).is_some();
        if removed {
            debug!(environment_id = %environment_id, "Proxy handler invalidated");
        }
        removed
    }

    /// Forget everything about an environment that was deleted
    pub fn evict(&self, environment_id: &str) {
        self.invalidate(environment_id);
        self.build_locks.remove(environment_id);
    }

    /// Drop handlers unused for longer than the idle period
    pub fn evict_idle(&self) -> usize {
        let now = millis_since(self.epoch);
        let idle_ms = self.idle_period.as_millis() as u64;
        let before = self.entries.len();

        self.entries.retain(|environment_id, entry| {
            let in_use = entry.leases.load(Ordering::SeqCst) > 0;
            let idle_for = now.saturating_sub(entry.last_used_ms.load(Ordering::SeqCst));
            let keep = in_use || idle_for < idle_ms;
            if !keep {
                debug!(environment_id = %environment_id, "Evicting idle proxy handler");
            }
            keep
        });

        before.saturating_sub(self.entries.len())
    }

    /// Number of handler constructions so far
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding leases on the cached handler of an environment
    pub fn leases(&self, environment_id: &str) -> usize {
        self.entries
            .get(environment_id)
            .map(|entry| entry.leases.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegate_environment::EnvironmentKind;
    use edgegate_tunnel::TunnelStore;

    fn factory(idle: Duration) -> ProxyFactory {
        ProxyFactory::new(
            TransportBuilder::new(Arc::new(TunnelStore::new())),
            Duration::from_secs(1),
            idle,
        )
    }

    fn env(url: &str) -> Environment {
        Environment::new("1", "local", EnvironmentKind::docker_http(), url)
    }

    #[tokio::test]
    async fn test_reuses_handler_for_same_fingerprint() {
        let factory = factory(Duration::from_secs(60));
        let first = factory.get_handler(&env("tcp://10.0.0.5:2375")).await.unwrap();
        let second = factory.get_handler(&env("tcp://10.0.0.5:2375")).await.unwrap();

        assert_eq!(first.build_id(), second.build_id());
        assert_eq!(factory.build_count(), 1);
        assert_eq!(factory.leases("1"), 2);

        drop(first);
        drop(second);
        assert_eq!(factory.leases("1"), 0);
    }

    #[tokio::test]
    async fn test_config_change_rebuilds_without_touching_old_handler() {
        let factory = factory(Duration::from_secs(60));
        let old = factory.get_handler(&env("tcp://10.0.0.5:2375")).await.unwrap();
        let new = factory.get_handler(&env("tcp://10.0.0.6:2375")).await.unwrap();

        assert_ne!(old.build_id(), new.build_id());
        assert_eq!(factory.build_count(), 2);
        assert_eq!(factory.len(), 1);
        // The lease taken before the change still points at the old configuration
        assert_ne!(old.fingerprint(), new.fingerprint());
    }

    #[tokio::test]
    async fn test_status_change_keeps_handler() {
        let factory = factory(Duration::from_secs(60));
        let mut environment = env("tcp://10.0.0.5:2375");
        factory.get_handler(&environment).await.unwrap();

        environment.status = edgegate_environment::EnvironmentStatus::Up;
        factory.get_handler(&environment).await.unwrap();
        assert_eq!(factory.build_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_build_once() {
        let factory = Arc::new(factory(Duration::from_secs(60)));
        let environment = env("tcp://10.0.0.5:2375");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let factory = factory.clone();
            let environment = environment.clone();
            handles.push(tokio::spawn(async move {
                factory.get_handler(&environment).await.unwrap().build_id()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        assert_eq!(factory.build_count(), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_cached() {
        let factory = factory(Duration::from_secs(60));
        let err = factory.get_handler(&env("ftp://nowhere")).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConfigInvalid(_)));
        assert!(factory.is_empty());
        assert_eq!(factory.build_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_spares_leased_entries() {
        let factory = factory(Duration::from_secs(30));
        let leased = factory.get_handler(&env("tcp://10.0.0.5:2375")).await.unwrap();

        let mut other = env("tcp://10.0.0.7:2375");
        other.id = "2".to_string();
        drop(factory.get_handler(&other).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(factory.evict_idle(), 1);
        assert_eq!(factory.len(), 1);

        drop(leased);
        assert_eq!(factory.evict_idle(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(factory.evict_idle(), 1);
        assert!(factory.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let factory = factory(Duration::from_secs(60));
        factory.get_handler(&env("tcp://10.0.0.5:2375")).await.unwrap();

        assert!(factory.invalidate("1"));
        assert!(!factory.invalidate("1"));
        factory.get_handler(&env("tcp://10.0.0.5:2375")).await.unwrap();
        assert_eq!(factory.build_count(), 2);
    }
}
