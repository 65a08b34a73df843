//! Periodic liveness snapshots
//!
//! Every round lists the known environments and probes each of them, at most
//! `workers` at a time, each probe bounded by its own timeout. Results go
//! through [`EnvironmentRegistry::record_probe`], which serializes them with
//! the tunnel server's own status writes.
//!
//! Status policy:
//! - a successful probe marks the environment `up`
//! - a failed probe keeps the previous status until `failure_threshold`
//!   consecutive failures, then marks it `down`
//! - a failed probe of a tunnel environment without an active tunnel marks it
//!   `down` at once

use dashmap::DashMap;
use edgegate_environment::{
    Environment, EnvironmentRegistry, EnvironmentStatus, StatusChange, StoreError,
};
use edgegate_proxy::ProxyError;
use edgegate_tunnel::TunnelStore;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SnapshotConfig;
use crate::prober::Prober;

/// How one probe was judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    Failed { consecutive: u32 },
    /// Tunnel environment with no active tunnel
    TunnelLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub environment_id: String,
    pub verdict: ProbeVerdict,
    pub change: StatusChange,
}

pub struct SnapshotScheduler {
    config: SnapshotConfig,
    registry: Arc<EnvironmentRegistry>,
    tunnels: Arc<TunnelStore>,
    prober: Arc<dyn Prober>,
    failures: DashMap<String, u32>,
    workers: Semaphore,
}

impl SnapshotScheduler {
    pub fn new(
        config: SnapshotConfig,
        registry: Arc<EnvironmentRegistry>,
        tunnels: Arc<TunnelStore>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let workers = Semaphore::new(config.workers.max(1));
        Self {
            config,
            registry,
            tunnels,
            prober,
            failures: DashMap::new(),
            workers,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Consecutive failed probes recorded for an environment
    pub fn consecutive_failures(&self, environment_id: &str) -> u32 {
        self.failures
            .get(environment_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Drop the probe history of a deleted environment
    pub fn forget(&self, environment_id: &str) {
        self.failures.remove(environment_id);
    }

    /// Run rounds every interval until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Snapshot scheduler started (interval {:?}, probe timeout {:?}, {} workers)",
            self.config.interval, self.config.probe_timeout, self.config.workers
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A round in progress is abandoned on shutdown
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.run_once() => {
                    if let Err(e) = result {
                        error!("Snapshot round failed: {}", e);
                    }
                }
            }
        }

        info!("Snapshot scheduler stopped");
    }

    /// Probe every environment once
    pub async fn run_once(self: &Arc<Self>) -> Result<Vec<ProbeOutcome>, StoreError> {
        let environments = self.registry.list().await?;
        let total = environments.len();

        let mut probes = JoinSet::new();
        for env in environments {
            let scheduler = self.clone();
            probes.spawn(async move { scheduler.snapshot(env).await });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => error!("Probe task failed: {}", e),
            }
        }

        debug!(
            "Snapshot round finished: {} environments, {} healthy",
            total,
            outcomes
                .iter()
                .filter(|o| o.verdict == ProbeVerdict::Healthy)
                .count()
        );
        Ok(outcomes)
    }

    async fn snapshot(&self, env: Environment) -> Option<ProbeOutcome> {
        let result = {
            let _permit = self.workers.acquire().await.ok()?;
            let limit = self.config.probe_timeout;
            match tokio::time::timeout(limit, self.prober.probe(&env, limit)).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::Timeout(limit)),
            }
        };

        self.apply(&env, result).await
    }

    async fn apply(&self, env: &Environment, result: Result<(), ProxyError>) -> Option<ProbeOutcome> {
        let tunnel_lost = env.is_tunnel() && !self.tunnels.contains(&env.id);

        let verdict = match &result {
            Ok(()) => {
                self.failures.remove(&env.id);
                if tunnel_lost {
                    ProbeVerdict::TunnelLost
                } else {
                    ProbeVerdict::Healthy
                }
            }
            Err(e) if tunnel_lost => {
                debug!(environment_id = %env.id, "Probe failed without a tunnel: {}", e);
                ProbeVerdict::TunnelLost
            }
            Err(e) => {
                let consecutive = {
                    let mut count = self.failures.entry(env.id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                warn!(
                    environment_id = %env.id,
                    consecutive,
                    "Probe failed: {}", e
                );
                ProbeVerdict::Failed { consecutive }
            }
        };

        let threshold = self.config.failure_threshold.max(1);
        let tunnels = self.tunnels.clone();
        let id = env.id.clone();
        let is_tunnel = env.is_tunnel();

        let decide = move |current: EnvironmentStatus| match verdict {
            // The tunnel may have gone away while the probe was in flight
            ProbeVerdict::Healthy if is_tunnel && !tunnels.contains(&id) => EnvironmentStatus::Down,
            ProbeVerdict::Healthy => EnvironmentStatus::Up,
            ProbeVerdict::TunnelLost => EnvironmentStatus::Down,
            ProbeVerdict::Failed { consecutive } if consecutive >= threshold => {
                EnvironmentStatus::Down
            }
            ProbeVerdict::Failed { .. } => current,
        };

        match self.registry.record_probe(&env.id, decide).await {
            Ok(Some(change)) => Some(ProbeOutcome {
                environment_id: env.id.clone(),
                verdict,
                change,
            }),
            Ok(None) => {
                // Deleted while the probe was running
                self.failures.remove(&env.id);
                None
            }
            Err(e) => {
                error!(environment_id = %env.id, "Failed to record probe: {}", e);
                None
            }
        }
    }
}
