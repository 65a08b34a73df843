//! Forwarding handler bound to one environment configuration

use base64::Engine;
use edgegate_environment::{ApiFamily, BackendCredentials, Environment};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::relay::{relay, RelayStats};
use crate::request::{connection_tokens, empty_body, ProxyBody, ProxyRequest};
use crate::transport::Transport;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response of a forwarded call
pub struct Forwarded {
    pub response: Response<ProxyBody>,
    /// Relay task of an upgraded session
    pub session: Option<JoinHandle<RelayStats>>,
}

/// Rewrites calls for one environment and forwards them over its transport
///
/// Immutable once built. A configuration change produces a new handler, so
/// calls already running keep the version they started with.
#[derive(Debug)]
pub struct ProxyHandler {
    environment_id: String,
    api: ApiFamily,
    fingerprint: String,
    build_id: u64,
    base_path: String,
    host: HeaderValue,
    authorization: Option<HeaderValue>,
    transport: Transport,
    dial_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(
        env: &Environment,
        transport: Transport,
        dial_timeout: Duration,
        build_id: u64,
    ) -> Result<Self, ProxyError> {
        let endpoint = env.endpoint()?;
        let host = HeaderValue::from_str(&endpoint.host_header())
            .map_err(|_| ProxyError::ConfigInvalid(format!("Invalid backend host in '{}'", env.url)))?;

        let authorization = env
            .credentials
            .as_ref()
            .map(authorization_header)
            .transpose()?;

        Ok(Self {
            environment_id: env.id.clone(),
            api: env.kind.api,
            fingerprint: env.fingerprint(),
            build_id,
            base_path: endpoint.base_path().to_string(),
            host,
            authorization,
            transport,
            dial_timeout,
        })
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn api(&self) -> ApiFamily {
        self.api
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Sequence number of the build that produced this handler
    pub fn build_id(&self) -> u64 {
        self.build_id
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Forward one call
    ///
    /// Every call gets its own backend connection. The connection is dropped
    /// when the response is finished, when the caller drops the response, or
    /// when `cancel` fires; for a tunnel that releases the sub-connection.
    pub async fn forward(
        &self,
        request: ProxyRequest,
        cancel: CancellationToken,
    ) -> Result<Forwarded, ProxyError> {
        let upgrade_protocol = request.upgrade_protocol().cloned();
        let ProxyRequest {
            method,
            path,
            headers,
            body,
            upgrade,
        } = request;

        let uri = self.backend_uri(&path)?;
        let mut outbound = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(body)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        *outbound.headers_mut() = self.backend_headers(&headers, upgrade_protocol.as_ref());

        let io = self
            .transport
            .connect(&self.environment_id, self.dial_timeout)
            .await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| self.upstream_error(e))?;

        let driver_cancel = cancel.clone();
        let environment_id = self.environment_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = conn.with_upgrades() => {
                    if let Err(e) = result {
                        debug!(environment_id = %environment_id, "Backend connection ended: {}", e);
                    }
                }
                _ = driver_cancel.cancelled() => {
                    debug!(environment_id = %environment_id, "Backend connection cancelled");
                }
            }
        });

        debug!(
            environment_id = %self.environment_id,
            transport = self.transport.name(),
            "Forwarding {} {}",
            method,
            path
        );

        let mut response = sender
            .send_request(outbound)
            .await
            .map_err(|e| self.upstream_error(e))?;
        drop(sender);

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            let session = self.switch_protocols(
                response.headers(),
                upgrade,
                upgrade_protocol.as_ref(),
                backend_upgrade,
                cancel,
            )?;

            let (parts, _) = response.into_parts();
            return Ok(Forwarded {
                response: Response::from_parts(parts, empty_body()),
                session: Some(session),
            });
        }

        strip_hop_by_hop(response.headers_mut());
        Ok(Forwarded {
            response: response.map(|body| body.boxed()),
            session: None,
        })
    }

    /// Issue the API family's liveness request and drain the answer
    pub async fn probe(&self) -> Result<StatusCode, ProxyError> {
        let request = ProxyRequest::get(self.api.probe_path());
        let forwarded = self.forward(request, CancellationToken::new()).await?;

        let status = forwarded.response.status();
        forwarded
            .response
            .into_body()
            .collect()
            .await
            .map_err(|e| self.upstream_error(e))?;
        Ok(status)
    }

    fn switch_protocols(
        &self,
        backend_headers: &HeaderMap,
        client_upgrade: Option<OnUpgrade>,
        requested: Option<&HeaderValue>,
        backend_upgrade: OnUpgrade,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<RelayStats>, ProxyError> {
        let (Some(client_upgrade), Some(requested)) = (client_upgrade, requested) else {
            return Err(ProxyError::UpgradeFailed(
                "backend switched protocols without an upgrade request".to_string(),
            ));
        };

        let offered = backend_headers.get(UPGRADE).ok_or_else(|| {
            ProxyError::UpgradeFailed("backend switched protocols without naming one".to_string())
        })?;
        if !header_eq_ignore_case(offered, requested) {
            return Err(ProxyError::UpgradeFailed(format!(
                "requested {:?} but backend switched to {:?}",
                requested, offered
            )));
        }

        let environment_id = self.environment_id.clone();
        Ok(tokio::spawn(async move {
            let upgraded = tokio::select! {
                upgraded = async { tokio::try_join!(client_upgrade, backend_upgrade) } => upgraded,
                _ = cancel.cancelled() => return RelayStats::default(),
            };

            match upgraded {
                Ok((client, backend)) => {
                    debug!(environment_id = %environment_id, "Upgraded session started");
                    relay(TokioIo::new(client), TokioIo::new(backend), cancel).await
                }
                Err(e) => {
                    warn!(environment_id = %environment_id, "Upgrade did not complete: {}", e);
                    RelayStats::default()
                }
            }
        }))
    }

    fn backend_uri(&self, path: &str) -> Result<Uri, ProxyError> {
        if !path.starts_with('/') {
            return Err(ProxyError::InvalidRequest(format!(
                "Path must start with '/': {}",
                path
            )));
        }
        format!("{}{}", self.base_path, path)
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid path '{}': {}", path, e)))
    }

    /// Headers sent to the backend
    ///
    /// Hop-by-hop headers and the caller's own credentials never reach the
    /// backend; the environment's credentials and host replace them.
    fn backend_headers(&self, inbound: &HeaderMap, upgrade: Option<&HeaderValue>) -> HeaderMap {
        let listed = connection_tokens(inbound);
        let mut headers = HeaderMap::with_capacity(inbound.len() + 3);

        for (name, value) in inbound {
            if is_hop_by_hop(name)
                || name == AUTHORIZATION
                || name == HOST
                || listed.iter().any(|token| token == name.as_str())
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        headers.insert(HOST, self.host.clone());
        if let Some(authorization) = &self.authorization {
            headers.insert(AUTHORIZATION, authorization.clone());
        }
        if let Some(protocol) = upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(UPGRADE, protocol.clone());
        }
        headers
    }

    fn upstream_error(&self, err: hyper::Error) -> ProxyError {
        let lost_connection = err.is_closed() || err.is_canceled() || err.is_incomplete_message();
        match &self.transport {
            Transport::TunnelDial { .. } if lost_connection => ProxyError::SubConnectionFailed {
                environment_id: self.environment_id.clone(),
                reason: err.to_string(),
            },
            _ => ProxyError::UpstreamProtocolError(err.to_string()),
        }
    }
}

fn authorization_header(credentials: &BackendCredentials) -> Result<HeaderValue, ProxyError> {
    let value = match credentials {
        BackendCredentials::Bearer { token } => format!("Bearer {}", token),
        BackendCredentials::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            format!("Basic {}", encoded)
        }
    };

    let mut header = HeaderValue::from_str(&value)
        .map_err(|_| ProxyError::ConfigInvalid("Credentials contain invalid characters".to_string()))?;
    header.set_sensitive(true);
    Ok(header)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed = connection_tokens(headers);
    for name in HOP_BY_HOP.iter().copied().map(String::from).chain(listed) {
        headers.remove(name.as_str());
    }
}

fn header_eq_ignore_case(a: &HeaderValue, b: &HeaderValue) -> bool {
    a.as_bytes().eq_ignore_ascii_case(b.as_bytes())
}
