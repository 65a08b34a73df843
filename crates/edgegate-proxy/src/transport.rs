//! Transport selection per environment
//!
//! A [`Transport`] is resolved once when a handler is built. Each forwarded
//! call then opens its own backend connection through it: a TCP socket, a
//! local socket or pipe, or a sub-connection of the environment's tunnel.

use edgegate_environment::{ConnectionKind, EndpointUrl, Environment, TlsSettings};
use edgegate_tunnel::{TunnelError, TunnelStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ProxyError;
use crate::tls::BackendTls;

pub trait BackendIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BackendIo for T {}

/// Boxed byte stream to a backend
pub type BackendStream = Box<dyn BackendIo>;

#[derive(Debug, Clone)]
pub enum Transport {
    DirectHttp {
        host: String,
        port: u16,
        tls: Option<BackendTls>,
    },
    DirectSocket {
        path: PathBuf,
    },
    TunnelDial {
        environment_id: String,
        /// Address the agent dials inside its own network
        target: String,
        tls: Option<BackendTls>,
        tunnels: Arc<TunnelStore>,
    },
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::DirectHttp { .. } => "direct-http",
            Transport::DirectSocket { .. } => "direct-socket",
            Transport::TunnelDial { .. } => "tunnel-dial",
        }
    }

    /// Open a fresh connection to the backend
    pub async fn connect(
        &self,
        environment_id: &str,
        dial_timeout: Duration,
    ) -> Result<BackendStream, ProxyError> {
        match self {
            Transport::DirectHttp { host, port, tls } => {
                let stream = tokio::time::timeout(dial_timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| {
                        ProxyError::unreachable(
                            environment_id,
                            format!("connect to {}:{} timed out", host, port),
                        )
                    })?
                    .map_err(|e| {
                        ProxyError::unreachable(
                            environment_id,
                            format!("connect to {}:{} failed: {}", host, port, e),
                        )
                    })?;
                let _ = stream.set_nodelay(true);

                wrap_tls(Box::new(stream), tls.as_ref(), environment_id).await
            }
            Transport::DirectSocket { path } => {
                let stream = tokio::time::timeout(dial_timeout, connect_local(path))
                    .await
                    .map_err(|_| {
                        ProxyError::unreachable(
                            environment_id,
                            format!("connect to {} timed out", path.display()),
                        )
                    })?
                    .map_err(|e| {
                        ProxyError::unreachable(
                            environment_id,
                            format!("connect to {} failed: {}", path.display(), e),
                        )
                    })?;
                Ok(stream)
            }
            Transport::TunnelDial {
                environment_id,
                target,
                tls,
                tunnels,
            } => {
                let tunnel = tunnels
                    .get_active(environment_id)
                    .ok_or_else(|| ProxyError::unreachable(environment_id, "no active tunnel"))?;

                let stream = tunnel
                    .connection()
                    .open_stream(target, dial_timeout)
                    .await
                    .map_err(|e| match e {
                        TunnelError::ConnectionClosed => {
                            ProxyError::unreachable(environment_id, "tunnel closed")
                        }
                        other => ProxyError::SubConnectionFailed {
                            environment_id: environment_id.clone(),
                            reason: other.to_string(),
                        },
                    })?;
                debug!(
                    environment_id = %environment_id,
                    stream_id = stream.id(),
                    "Opened tunnel sub-connection to {}",
                    target
                );

                wrap_tls(Box::new(stream), tls.as_ref(), environment_id).await
            }
        }
    }
}

async fn wrap_tls(
    stream: BackendStream,
    tls: Option<&BackendTls>,
    environment_id: &str,
) -> Result<BackendStream, ProxyError> {
    match tls {
        None => Ok(stream),
        Some(tls) => {
            let stream = tls
                .connector()
                .connect(tls.server_name(), stream)
                .await
                .map_err(|e| ProxyError::unreachable(environment_id, format!("TLS handshake failed: {}", e)))?;
            Ok(Box::new(stream))
        }
    }
}

#[cfg(unix)]
async fn connect_local(path: &std::path::Path) -> std::io::Result<BackendStream> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
async fn connect_local(path: &std::path::Path) -> std::io::Result<BackendStream> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    Ok(Box::new(pipe))
}

/// Resolves environments to transports
#[derive(Debug, Clone)]
pub struct TransportBuilder {
    tunnels: Arc<TunnelStore>,
}

impl TransportBuilder {
    pub fn new(tunnels: Arc<TunnelStore>) -> Self {
        Self { tunnels }
    }

    pub fn build(&self, env: &Environment) -> Result<Transport, ProxyError> {
        let endpoint = env.endpoint()?;

        match env.kind.connection {
            ConnectionKind::DirectHttp => match endpoint {
                EndpointUrl::Tcp {
                    host, port, https, ..
                } => {
                    let tls = backend_tls(&env.tls, https, &host)?;
                    Ok(Transport::DirectHttp { host, port, tls })
                }
                _ => Err(ProxyError::ConfigInvalid(format!(
                    "Environment {} is a direct HTTP environment but '{}' is a local socket",
                    env.id, env.url
                ))),
            },
            ConnectionKind::DirectSocket => match endpoint {
                EndpointUrl::Unix(path) => Ok(Transport::DirectSocket { path }),
                EndpointUrl::NamedPipe(pipe) if cfg!(windows) => Ok(Transport::DirectSocket {
                    path: PathBuf::from(pipe),
                }),
                EndpointUrl::NamedPipe(_) => Err(ProxyError::ConfigInvalid(
                    "Named pipes are only supported on Windows".to_string(),
                )),
                EndpointUrl::Tcp { .. } => Err(ProxyError::ConfigInvalid(format!(
                    "Environment {} is a socket environment but '{}' is a network address",
                    env.id, env.url
                ))),
            },
            ConnectionKind::Tunnel => {
                let tls = match &endpoint {
                    EndpointUrl::Tcp { host, https, .. } => backend_tls(&env.tls, *https, host)?,
                    _ => None,
                };
                Ok(Transport::TunnelDial {
                    environment_id: env.id.clone(),
                    target: endpoint.agent_target(),
                    tls,
                    tunnels: self.tunnels.clone(),
                })
            }
        }
    }
}

fn backend_tls(settings: &TlsSettings, https: bool, host: &str) -> Result<Option<BackendTls>, ProxyError> {
    if settings.enabled {
        Ok(Some(BackendTls::new(settings, host)?))
    } else if https {
        Ok(Some(BackendTls::new(&TlsSettings::enabled(), host)?))
    } else {
        Ok(None)
    }
}
