//! Application context: owns the shared stores and wires the components

use anyhow::{bail, Context, Result};
use edgegate_auth::{CredentialVerifier, JwtCredentialVerifier, StaticCredentialVerifier};
use edgegate_environment::{
    EndpointUrl, Environment, EnvironmentKind, EnvironmentRegistry, EnvironmentStore,
    InMemoryEnvironmentStore, StoreError,
};
use edgegate_proxy::EndpointProxyRouter;
use edgegate_snapshot::SnapshotScheduler;
use edgegate_tunnel::{TunnelServer, TunnelStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api;
use crate::config::AppConfig;

/// Id of the environment created from `--host`
pub const PRIMARY_ENVIRONMENT_ID: &str = "1";

/// Smallest interval between two idle eviction passes
const MIN_EVICTION_INTERVAL: Duration = Duration::from_secs(1);

pub struct AppContext {
    pub config: AppConfig,
    pub registry: Arc<EnvironmentRegistry>,
    pub tunnels: Arc<TunnelStore>,
    pub router: Arc<EndpointProxyRouter>,
    pub scheduler: Arc<SnapshotScheduler>,
    pub tunnel_server: Arc<TunnelServer>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn EnvironmentStore>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let registry = Arc::new(EnvironmentRegistry::new(store));
        let tunnels = Arc::new(TunnelStore::new());

        let router = Arc::new(EndpointProxyRouter::new(
            registry.clone(),
            tunnels.clone(),
            config.proxy.clone(),
        ));
        let scheduler = Arc::new(SnapshotScheduler::new(
            config.snapshot.clone(),
            registry.clone(),
            tunnels.clone(),
            router.clone(),
        ));
        let tunnel_server = Arc::new(TunnelServer::new(
            config.tunnel.clone(),
            tunnels.clone(),
            registry.clone(),
            verifier,
        ));

        Self {
            config,
            registry,
            tunnels,
            router,
            scheduler,
            tunnel_server,
        }
    }

    /// Context backed by the in-memory store, with agent credentials from config
    pub fn in_memory(config: AppConfig) -> Self {
        let verifier: Arc<dyn CredentialVerifier> = match &config.edge_secret {
            Some(secret) => Arc::new(JwtCredentialVerifier::new(secret.as_bytes())),
            None => {
                warn!("No edge secret configured, edge agents cannot authenticate");
                Arc::new(StaticCredentialVerifier::new())
            }
        };
        Self::new(config, Arc::new(InMemoryEnvironmentStore::new()), verifier)
    }

    /// Create the primary environment from `--host` unless it already exists
    pub async fn bootstrap_primary(&self) -> Result<Option<Environment>> {
        let Some(url) = &self.config.host else {
            return Ok(None);
        };

        let endpoint = EndpointUrl::validate_host_flag(url)?;
        if let Some(existing) = self.registry.get(PRIMARY_ENVIRONMENT_ID).await? {
            debug!("Primary environment already exists ({})", existing.url);
            return Ok(None);
        }

        let kind = match endpoint {
            EndpointUrl::Tcp { .. } => EnvironmentKind::docker_http(),
            EndpointUrl::Unix(_) | EndpointUrl::NamedPipe(_) => EnvironmentKind::docker_socket(),
        };
        let mut env = Environment::new(PRIMARY_ENVIRONMENT_ID, "primary", kind, url.clone());
        if self.config.host_tls.is_enabled() {
            if kind != EnvironmentKind::docker_http() {
                bail!("TLS options only apply to a tcp:// host");
            }
            env = env.with_tls(self.config.host_tls.load().await?);
        }
        self.registry.save(env.clone()).await?;

        info!("Created primary environment for {}", url);
        Ok(Some(env))
    }

    /// Remove an environment with its tunnel and cached handler
    pub async fn delete_environment(&self, environment_id: &str) -> Result<bool, StoreError> {
        // Record first, so the tunnel teardown finds nothing to mark down
        let removed = self.registry.delete(environment_id).await?;

        if self
            .tunnels
            .remove(environment_id, "environment deleted")
            .is_some()
        {
            info!(environment_id = %environment_id, "Closed tunnel of deleted environment");
        }
        self.router.factory().evict(environment_id);
        self.scheduler.forget(environment_id);

        Ok(removed.is_some())
    }

    /// Run every component until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let tunnel_listener = self
            .tunnel_server
            .bind()
            .await
            .context("Failed to start tunnel server")?;
        let api_listener = TcpListener::bind(self.config.api_bind)
            .await
            .with_context(|| format!("Failed to bind API address {}", self.config.api_bind))?;

        let loaded = self.registry.refresh().await?;
        info!("Loaded {} environments", loaded);

        let tunnel_task = tokio::spawn(
            self.tunnel_server
                .clone()
                .serve(tunnel_listener, shutdown.clone()),
        );
        let snapshot_task = tokio::spawn(self.scheduler.clone().run(shutdown.clone()));
        let eviction_task = tokio::spawn(evict_idle_handlers(self.clone(), shutdown.clone()));

        api::serve(self.clone(), api_listener, shutdown.clone()).await;

        let _ = tokio::join!(tunnel_task, snapshot_task, eviction_task);
        self.tunnels.close_all("server shutting down");
        Ok(())
    }
}

/// Periodically drop proxy handlers nobody used for a while
async fn evict_idle_handlers(ctx: Arc<AppContext>, shutdown: CancellationToken) {
    let period = (ctx.config.proxy.cache_idle_period / 4).max(MIN_EVICTION_INTERVAL);
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = ctx.router.factory().evict_idle();
                if evicted > 0 {
                    debug!("Evicted {} idle proxy handlers", evicted);
                }
            }
        }
    }
}
