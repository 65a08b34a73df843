//! Active tunnel registry

use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use edgegate_proto::AgentMetadata;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::MuxConnection;

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Active = 0,
    Closing = 1,
}

/// An agent-initiated tunnel for one environment
#[derive(Debug)]
pub struct Tunnel {
    environment_id: String,
    connection: Arc<MuxConnection>,
    metadata: AgentMetadata,
    established_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    state: AtomicU8,
    generation: u64,
}

impl Tunnel {
    fn new(
        environment_id: String,
        connection: Arc<MuxConnection>,
        metadata: AgentMetadata,
        generation: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            environment_id,
            connection,
            metadata,
            established_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            state: AtomicU8::new(TunnelState::Active as u8),
            generation,
        }
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn connection(&self) -> &Arc<MuxConnection> {
        &self.connection
    }

    pub fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Distinguishes successive tunnels of the same environment
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(self.established_at)
    }

    /// Record activity from the agent
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn state(&self) -> TunnelState {
        match self.state.load(Ordering::Acquire) {
            0 => TunnelState::Active,
            _ => TunnelState::Closing,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == TunnelState::Active && !self.connection.is_closed()
    }

    /// Move to `Closing`; returns false if it already was
    pub fn mark_closing(&self) -> bool {
        self.state
            .swap(TunnelState::Closing as u8, Ordering::AcqRel)
            == TunnelState::Active as u8
    }

    /// Mark closing and tear down the connection with all its sub-connections
    pub fn close(&self, reason: &str) {
        if self.mark_closing() {
            debug!(environment_id = %self.environment_id, reason = %reason, "Closing tunnel");
        }
        self.connection.close_with_reason(reason);
    }
}

/// Maps environment identifiers to their single active tunnel
///
/// Installation and removal are atomic per identifier: a new tunnel for an
/// identifier that already holds one closes the old tunnel under the same
/// entry lock that installs the new one.
#[derive(Debug, Default)]
pub struct TunnelStore {
    tunnels: DashMap<String, Arc<Tunnel>>,
    next_generation: AtomicU64,
}

impl TunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a tunnel for an environment, closing any previous one
    pub fn install(
        &self,
        environment_id: &str,
        connection: Arc<MuxConnection>,
        metadata: AgentMetadata,
    ) -> Arc<Tunnel> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let tunnel = Arc::new(Tunnel::new(
            environment_id.to_string(),
            connection,
            metadata,
            generation,
        ));

        match self.tunnels.entry(environment_id.to_string()) {
            Entry::Occupied(mut entry) => {
                info!(
                    environment_id = %environment_id,
                    replaced_generation = entry.get().generation(),
                    "Replacing existing tunnel"
                );
                entry.get().close("replaced by a new connection");
                entry.insert(tunnel.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(tunnel.clone());
            }
        }

        tunnel
    }

    /// Active tunnel for an environment, if any
    pub fn get_active(&self, environment_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels
            .get(environment_id)
            .filter(|tunnel| tunnel.is_active())
            .map(|tunnel| tunnel.clone())
    }

    pub fn contains(&self, environment_id: &str) -> bool {
        self.get_active(environment_id).is_some()
    }

    /// Remove a specific tunnel generation
    ///
    /// Does nothing if the environment has since installed a newer tunnel.
    pub fn remove_if(&self, environment_id: &str, generation: u64) -> Option<Arc<Tunnel>> {
        self.tunnels
            .remove_if(environment_id, |_, tunnel| tunnel.generation() == generation)
            .map(|(_, tunnel)| tunnel)
    }

    /// Remove and close whatever tunnel the environment holds
    pub fn remove(&self, environment_id: &str, reason: &str) -> Option<Arc<Tunnel>> {
        let (_, tunnel) = self.tunnels.remove(environment_id)?;
        tunnel.close(reason);
        Some(tunnel)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn environment_ids(&self) -> Vec<String> {
        self.tunnels.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close every tunnel
    pub fn close_all(&self, reason: &str) {
        let ids = self.environment_ids();
        for id in ids {
            self.remove(&id, reason);
        }
    }
}
