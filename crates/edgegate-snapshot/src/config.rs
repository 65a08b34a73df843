use std::time::Duration;

/// Snapshot schedule and probe policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Time between two snapshot rounds
    pub interval: Duration,
    /// Per-probe limit, independent of proxied request timeouts
    pub probe_timeout: Duration,
    /// Probes allowed in flight at once
    pub workers: usize,
    /// Consecutive failures before an environment is marked down
    pub failure_threshold: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(10),
            workers: 8,
            failure_threshold: 2,
        }
    }
}
