//! Entry point for proxied calls

use bytes::Bytes;
use edgegate_environment::{Environment, EnvironmentRegistry, EnvironmentStatus};
use edgegate_tunnel::TunnelStore;
use http::Response;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::factory::{HandlerLease, ProxyFactory};
use crate::request::{ProxyBody, ProxyRequest};
use crate::transport::TransportBuilder;

/// Resolves an environment and forwards calls to it
///
/// Never writes environment status: a `down` environment is answered with
/// [`ProxyError::EnvironmentUnreachable`] before any connection is attempted.
pub struct EndpointProxyRouter {
    registry: Arc<EnvironmentRegistry>,
    factory: Arc<ProxyFactory>,
    config: ProxyConfig,
}

impl EndpointProxyRouter {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        tunnels: Arc<TunnelStore>,
        config: ProxyConfig,
    ) -> Self {
        let factory = Arc::new(ProxyFactory::new(
            TransportBuilder::new(tunnels),
            config.dial_timeout,
            config.cache_idle_period,
        ));
        Self {
            registry,
            factory,
            config,
        }
    }

    pub fn factory(&self) -> &Arc<ProxyFactory> {
        &self.factory
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Forward a call to an environment
    ///
    /// `cancel` ends an upgraded session started by this call. The request
    /// timeout covers the wait for response headers; streamed bodies and
    /// upgraded sessions run until either side finishes.
    pub async fn route(
        &self,
        environment_id: &str,
        request: ProxyRequest,
        cancel: CancellationToken,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let env = self
            .registry
            .get(environment_id)
            .await?
            .ok_or_else(|| ProxyError::EnvironmentNotFound(environment_id.to_string()))?;

        if env.status == EnvironmentStatus::Down {
            debug!(environment_id = %environment_id, "Environment is down, failing fast");
            return Err(ProxyError::unreachable(environment_id, "environment is down"));
        }

        let lease = self.factory.get_handler(&env).await?;

        let forwarded = tokio::time::timeout(
            self.config.request_timeout,
            lease.forward(request, cancel),
        )
        .await
        .map_err(|_| ProxyError::Timeout(self.config.request_timeout))??;

        match forwarded.session {
            Some(session) => {
                // The session holds the lease until the relay ends
                tokio::spawn(async move {
                    let _lease = lease;
                    let _ = session.await;
                });
                Ok(forwarded.response)
            }
            None => Ok(forwarded
                .response
                .map(|body| LeasedBody { inner: body, _lease: lease }.boxed())),
        }
    }

    /// Probe an environment through its forwarding handler
    ///
    /// Unlike [`route`](Self::route) this ignores the recorded status, so a
    /// `down` environment can be seen coming back.
    pub async fn probe(&self, env: &Environment, timeout: Duration) -> Result<(), ProxyError> {
        let lease = self.factory.get_handler(env).await?;

        let status = tokio::time::timeout(timeout, lease.probe())
            .await
            .map_err(|_| ProxyError::Timeout(timeout))??;

        if status.is_success() {
            Ok(())
        } else {
            Err(ProxyError::UpstreamProtocolError(format!(
                "probe {} answered {}",
                env.kind.api.probe_path(),
                status
            )))
        }
    }
}

/// Response body that keeps its handler leased until it is dropped
struct LeasedBody {
    inner: ProxyBody,
    _lease: HandlerLease,
}

impl Body for LeasedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
