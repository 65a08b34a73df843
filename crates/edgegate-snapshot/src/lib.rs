//! Liveness snapshots of environments
//!
//! [`SnapshotScheduler`] periodically probes every environment through the
//! same transports proxied calls use, and turns the results into `up`/`down`
//! status with hysteresis so a single transient failure does not flap.

pub mod config;
pub mod prober;
pub mod scheduler;

pub use config::SnapshotConfig;
pub use prober::Prober;
pub use scheduler::{ProbeOutcome, ProbeVerdict, SnapshotScheduler};
