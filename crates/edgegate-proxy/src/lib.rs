//! Environment proxy
//!
//! [`EndpointProxyRouter`] resolves the target environment, fails fast when it
//! is down, and forwards the call through a [`ProxyHandler`] obtained from the
//! [`ProxyFactory`] cache. Handlers reach their backend over one of the
//! [`Transport`] variants and switch to a raw byte relay when the backend
//! accepts a protocol upgrade.

pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
pub mod relay;
pub mod request;
pub mod router;
pub mod tls;
pub mod transport;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use factory::{HandlerLease, ProxyFactory};
pub use handler::{Forwarded, ProxyHandler};
pub use relay::{relay, RelayStats};
pub use request::{empty_body, full_body, is_upgrade_request, ProxyBody, ProxyRequest};
pub use router::EndpointProxyRouter;
pub use tls::BackendTls;
pub use transport::{BackendStream, Transport, TransportBuilder};
