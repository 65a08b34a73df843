//! Environment records and liveness state
//!
//! Environments are owned by an external record store, reached through the
//! [`EnvironmentStore`] trait. [`EnvironmentRegistry`] keeps a read-mostly
//! cached view of them and is the single path through which liveness status is
//! written, one writer at a time per environment.

pub mod model;
pub mod registry;
pub mod store;
pub mod url;

pub use model::{
    ApiFamily, BackendCredentials, ConnectionKind, Environment, EnvironmentKind,
    EnvironmentStatus, TlsSettings,
};
pub use registry::{EnvironmentRegistry, StatusChange};
pub use store::{EnvironmentStore, InMemoryEnvironmentStore, StoreError};
pub use url::{EndpointUrl, EndpointUrlError};
