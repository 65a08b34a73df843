use async_trait::async_trait;
use edgegate_environment::Environment;
use edgegate_proxy::{EndpointProxyRouter, ProxyError};
use std::time::Duration;

/// Lightweight liveness check of one environment
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, env: &Environment, timeout: Duration) -> Result<(), ProxyError>;
}

/// Probes travel the same transport resolution as proxied calls
#[async_trait]
impl Prober for EndpointProxyRouter {
    async fn probe(&self, env: &Environment, timeout: Duration) -> Result<(), ProxyError> {
        EndpointProxyRouter::probe(self, env, timeout).await
    }
}
