//! Reverse tunnel server
//!
//! Accepts agent connections, validates the identity frame, then hands the
//! connection to a [`MuxConnection`] and supervises it until the agent goes
//! silent, disconnects, or is replaced.

use edgegate_auth::CredentialVerifier;
use edgegate_environment::{EnvironmentRegistry, EnvironmentStatus, StoreError};
use edgegate_proto::{
    AgentMetadata, CodecError, ControlMessage, Frame, FrameCodec, MuxError, RejectCode,
    PROTOCOL_VERSION,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ControlReceiver, MuxConnection, Role};
use crate::store::{Tunnel, TunnelStore};

/// Tunnel server errors
#[derive(Debug, Error)]
pub enum TunnelServerError {
    #[error("Failed to bind tunnel listener on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake rejected ({code}): {reason}")]
    HandshakeRejected { code: RejectCode, reason: String },

    #[error("No identity frame within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Frame error: {0}")]
    Frame(#[from] MuxError),

    #[error("Environment store error: {0}")]
    Store(#[from] StoreError),
}

impl TunnelServerError {
    fn rejected(code: RejectCode, reason: impl Into<String>) -> Self {
        TunnelServerError::HandshakeRejected {
            code,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelServerConfig {
    pub bind_addr: SocketAddr,
    /// Interval at which agents must send a keepalive
    pub heartbeat_interval: Duration,
    /// Consecutive missed keepalives after which a tunnel is considered lost
    pub heartbeat_loss_threshold: u32,
    pub handshake_timeout: Duration,
}

impl Default for TunnelServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_loss_threshold: 2,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl TunnelServerConfig {
    /// Silence after which a tunnel is torn down
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_loss_threshold.max(1)
    }
}

/// Why a supervised tunnel ended
#[derive(Debug)]
enum TunnelEnd {
    HeartbeatLost,
    Disconnected(String),
    TransportClosed,
}

pub struct TunnelServer {
    config: TunnelServerConfig,
    tunnels: Arc<TunnelStore>,
    registry: Arc<EnvironmentRegistry>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl TunnelServer {
    pub fn new(
        config: TunnelServerConfig,
        tunnels: Arc<TunnelStore>,
        registry: Arc<EnvironmentRegistry>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            config,
            tunnels,
            registry,
            verifier,
        }
    }

    pub fn config(&self) -> &TunnelServerConfig {
        &self.config
    }

    pub fn tunnels(&self) -> &Arc<TunnelStore> {
        &self.tunnels
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener, TunnelServerError> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| TunnelServerError::Bind {
                address: self.config.bind_addr,
                source,
            })
    }

    /// Bind and run the accept loop until `shutdown` fires
    ///
    /// Only a bind failure is returned; per-connection failures are logged.
    pub async fn listen(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), TunnelServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Run the accept loop on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("Tunnel server listening on {}", addr),
            Err(_) => info!("Tunnel server listening"),
        }

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted agent connection from {}", peer_addr);
                    let _ = stream.set_nodelay(true);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer_addr.to_string()).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept agent connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Tunnel server shutting down");
        self.tunnels.close_all("server shutting down");
    }

    /// Handshake and supervise one agent connection
    pub async fn handle_connection<T>(self: Arc<Self>, io: T, peer: String)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());

        let (environment_id, metadata) = match self.handshake(&mut framed).await {
            Ok(identity) => identity,
            Err(TunnelServerError::HandshakeRejected { code, reason }) => {
                warn!(peer = %peer, code = %code, "Rejected agent handshake: {}", reason);
                if let Ok(frame) = Frame::control(&ControlMessage::HelloRejected { code, reason }) {
                    let _ = framed.send(frame).await;
                }
                let _ = framed.close().await;
                return;
            }
            Err(e) => {
                warn!(peer = %peer, "Agent handshake failed: {}", e);
                return;
            }
        };

        let accepted = ControlMessage::HelloAccepted {
            environment_id: environment_id.clone(),
            heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
        };
        let sent = match Frame::control(&accepted) {
            Ok(frame) => framed.send(frame).await.map_err(TunnelServerError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!(peer = %peer, environment_id = %environment_id, "Failed to accept agent: {}", e);
            return;
        }

        let (connection, control) = MuxConnection::from_framed(framed, Role::Server);
        let tunnel = self.tunnels.install(&environment_id, connection, metadata);

        info!(
            environment_id = %environment_id,
            peer = %peer,
            agent_host = %tunnel.metadata().hostname,
            agent_version = %tunnel.metadata().version,
            "Tunnel established"
        );

        if let Err(e) = self
            .registry
            .set_status(&environment_id, EnvironmentStatus::Up)
            .await
        {
            error!(environment_id = %environment_id, "Failed to mark environment up: {}", e);
        }

        let end = self.supervise(&tunnel, control).await;
        self.retire(&tunnel, end).await;
    }

    async fn handshake<T>(
        &self,
        framed: &mut Framed<T, FrameCodec>,
    ) -> Result<(String, AgentMetadata), TunnelServerError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = match tokio::time::timeout(self.config.handshake_timeout, framed.next()).await {
            Err(_) => {
                return Err(TunnelServerError::HandshakeTimeout(
                    self.config.handshake_timeout,
                ))
            }
            Ok(None) => return Err(TunnelServerError::ClosedDuringHandshake),
            Ok(Some(frame)) => frame?,
        };

        let Ok(ControlMessage::Hello {
            environment_id,
            credential,
            protocol_version,
            metadata,
        }) = frame.control_message()
        else {
            return Err(TunnelServerError::rejected(
                RejectCode::MalformedHello,
                "first frame must be Hello",
            ));
        };

        if protocol_version != PROTOCOL_VERSION {
            return Err(TunnelServerError::rejected(
                RejectCode::ProtocolMismatch,
                format!(
                    "server speaks protocol {}, agent sent {}",
                    PROTOCOL_VERSION, protocol_version
                ),
            ));
        }

        // Nothing about the environment is revealed before the peer authenticates
        self.verifier
            .verify(&environment_id, &credential)
            .await
            .map_err(|e| TunnelServerError::rejected(RejectCode::InvalidCredential, e.to_string()))?;

        let environment = self.registry.get(&environment_id).await?.ok_or_else(|| {
            TunnelServerError::rejected(
                RejectCode::UnknownEnvironment,
                format!("no environment '{}'", environment_id),
            )
        })?;

        if !environment.is_tunnel() {
            return Err(TunnelServerError::rejected(
                RejectCode::NotEdgeEnvironment,
                format!("environment '{}' is not an edge environment", environment_id),
            ));
        }

        Ok((environment_id, metadata))
    }

    /// Heartbeat read loop; returns when the tunnel must be retired
    async fn supervise(&self, tunnel: &Arc<Tunnel>, mut control: ControlReceiver) -> TunnelEnd {
        let connection = tunnel.connection().clone();
        let deadline_span = self.config.heartbeat_deadline();
        let deadline = tokio::time::sleep(deadline_span);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                message = control.recv() => match message {
                    Some(ControlMessage::Heartbeat { timestamp }) => {
                        trace!(environment_id = %tunnel.environment_id(), "Heartbeat");
                        tunnel.touch();
                        deadline.as_mut().reset(Instant::now() + deadline_span);
                        if connection
                            .send_control(&ControlMessage::HeartbeatAck { timestamp })
                            .is_err()
                        {
                            return TunnelEnd::TransportClosed;
                        }
                    }
                    Some(ControlMessage::Disconnect { reason }) => {
                        return TunnelEnd::Disconnected(reason);
                    }
                    Some(other) => {
                        debug!(
                            environment_id = %tunnel.environment_id(),
                            "Ignoring unexpected control message: {:?}",
                            other
                        );
                    }
                    None => return TunnelEnd::TransportClosed,
                },
                _ = &mut deadline => return TunnelEnd::HeartbeatLost,
                _ = connection.closed() => return TunnelEnd::TransportClosed,
            }
        }
    }

    /// Tear down a tunnel and, if it was still the installed one, mark the
    /// environment down
    async fn retire(&self, tunnel: &Arc<Tunnel>, end: TunnelEnd) {
        let environment_id = tunnel.environment_id().to_string();

        tunnel.mark_closing();
        let was_installed = self
            .tunnels
            .remove_if(&environment_id, tunnel.generation())
            .is_some();
        tunnel.connection().close();

        match &end {
            TunnelEnd::HeartbeatLost => warn!(
                environment_id = %environment_id,
                last_activity = %tunnel.last_activity(),
                "No heartbeat within {:?}, tunnel lost",
                self.config.heartbeat_deadline()
            ),
            TunnelEnd::Disconnected(reason) => {
                info!(environment_id = %environment_id, "Agent disconnected: {}", reason)
            }
            TunnelEnd::TransportClosed if was_installed => {
                warn!(environment_id = %environment_id, "Tunnel transport closed")
            }
            TunnelEnd::TransportClosed => {
                debug!(environment_id = %environment_id, "Replaced tunnel closed")
            }
        }

        if !was_installed {
            return;
        }

        // A tunnel installed since removal keeps the environment up
        let tunnels = self.tunnels.clone();
        let id = environment_id.clone();
        let result = self
            .registry
            .update_status(&environment_id, move |current| {
                if tunnels.contains(&id) {
                    current
                } else {
                    EnvironmentStatus::Down
                }
            })
            .await;

        if let Err(e) = result {
            error!(environment_id = %environment_id, "Failed to mark environment down: {}", e);
        }
    }
}
