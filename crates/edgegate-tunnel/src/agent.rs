//! Edge agent: the remote end of a tunnel
//!
//! Connects out to the tunnel server, announces its environment, emits
//! keepalives, and serves sub-connections the server opens by dialing the
//! named target inside the agent's network.

use edgegate_proto::{
    AgentMetadata, CodecError, ControlMessage, Frame, FrameCodec, MuxError, RejectCode,
    PROTOCOL_VERSION,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ControlReceiver, IncomingStream, MuxConnection, Role};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to connect to tunnel server {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake rejected ({code}): {reason}")]
    Rejected { code: RejectCode, reason: String },

    #[error("Handshake timed out")]
    Timeout,

    #[error("Unexpected handshake reply: {0}")]
    UnexpectedReply(String),

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Frame error: {0}")]
    Frame(#[from] MuxError),
}

#[derive(Debug, Clone)]
pub struct EdgeAgentConfig {
    /// Tunnel server address (`host:port`)
    pub server_addr: String,
    pub environment_id: String,
    pub credential: String,
    /// Bound on TCP connect plus handshake
    pub connect_timeout: Duration,
    /// Bound on dialing a local target for one sub-connection
    pub dial_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl EdgeAgentConfig {
    pub fn new(
        server_addr: impl Into<String>,
        environment_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            environment_id: environment_id.into(),
            credential: credential.into(),
            connect_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Handle to a connected agent
#[derive(Debug, Clone)]
pub struct AgentHandle {
    connection: Arc<MuxConnection>,
    paused: Arc<AtomicBool>,
    heartbeat_interval: Duration,
}

impl AgentHandle {
    pub fn connection(&self) -> &Arc<MuxConnection> {
        &self.connection
    }

    /// Interval announced by the server
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Stop sending keepalives while keeping the connection open
    pub fn pause_heartbeats(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_heartbeats(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub async fn closed(&self) {
        self.connection.closed().await
    }

    /// Disconnect from the server
    pub fn shutdown(&self) {
        self.connection.close_with_reason("agent shutting down");
    }
}

pub struct EdgeAgent;

impl EdgeAgent {
    /// Connect and handshake once
    pub async fn connect(config: &EdgeAgentConfig) -> Result<AgentHandle, AgentError> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(&config.server_addr),
        )
        .await
        .map_err(|_| AgentError::Timeout)?
        .map_err(|source| AgentError::Connect {
            address: config.server_addr.clone(),
            source,
        })?;
        let _ = stream.set_nodelay(true);

        Self::connect_with(stream, config).await
    }

    /// Handshake over an already established byte stream
    pub async fn connect_with<T>(io: T, config: &EdgeAgentConfig) -> Result<AgentHandle, AgentError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());

        let hello = ControlMessage::Hello {
            environment_id: config.environment_id.clone(),
            credential: config.credential.clone(),
            protocol_version: PROTOCOL_VERSION,
            metadata: AgentMetadata::current(env!("CARGO_PKG_VERSION")),
        };
        framed.send(Frame::control(&hello)?).await?;

        let reply = tokio::time::timeout(config.connect_timeout, framed.next())
            .await
            .map_err(|_| AgentError::Timeout)?
            .ok_or(AgentError::Closed)??;

        let heartbeat_interval = match reply.control_message()? {
            ControlMessage::HelloAccepted {
                heartbeat_interval_ms,
                ..
            } => Duration::from_millis(heartbeat_interval_ms.max(1)),
            ControlMessage::HelloRejected { code, reason } => {
                return Err(AgentError::Rejected { code, reason })
            }
            other => return Err(AgentError::UnexpectedReply(format!("{:?}", other))),
        };

        info!(
            environment_id = %config.environment_id,
            "Tunnel established, heartbeat every {:?}",
            heartbeat_interval
        );

        let (connection, control) = MuxConnection::from_framed(framed, Role::Agent);
        let paused = Arc::new(AtomicBool::new(false));

        tokio::spawn(heartbeat_loop(
            connection.clone(),
            control,
            heartbeat_interval,
            paused.clone(),
        ));
        tokio::spawn(accept_loop(connection.clone(), config.dial_timeout));

        Ok(AgentHandle {
            connection,
            paused,
            heartbeat_interval,
        })
    }

    /// Stay connected until `shutdown` fires, reconnecting with exponential backoff
    ///
    /// A rejected handshake is returned as an error: retrying the same
    /// identity cannot succeed.
    pub async fn run(config: EdgeAgentConfig, shutdown: CancellationToken) -> Result<(), AgentError> {
        let mut backoff = config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match Self::connect(&config).await {
                Ok(handle) => {
                    backoff = config.initial_backoff;
                    attempt = 0;

                    tokio::select! {
                        _ = handle.closed() => warn!("Tunnel lost, reconnecting"),
                        _ = shutdown.cancelled() => {
                            handle.shutdown();
                            return Ok(());
                        }
                    }
                }
                Err(e @ AgentError::Rejected { .. }) => {
                    error!("{}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Connection to {} failed (attempt {}): {}",
                        config.server_addr, attempt, e
                    );
                }
            }

            debug!("Reconnecting in {:?}", backoff);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
            backoff = (backoff * 2).min(config.max_backoff);
        }
    }
}

async fn heartbeat_loop(
    connection: Arc<MuxConnection>,
    mut control: ControlReceiver,
    interval: Duration,
    paused: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                let timestamp = chrono::Utc::now().timestamp_millis() as u64;
                if connection.send_control(&ControlMessage::Heartbeat { timestamp }).is_err() {
                    break;
                }
            }
            message = control.recv() => match message {
                Some(ControlMessage::HeartbeatAck { timestamp }) => {
                    trace!("Heartbeat {} acknowledged", timestamp);
                }
                Some(ControlMessage::Disconnect { reason }) => {
                    info!("Server closed the tunnel: {}", reason);
                    connection.close();
                    break;
                }
                Some(other) => debug!("Ignoring unexpected control message: {:?}", other),
                None => break,
            },
        }
    }

    debug!("Heartbeat loop ended");
}

async fn accept_loop(connection: Arc<MuxConnection>, dial_timeout: Duration) {
    while let Some(incoming) = connection.accept().await {
        tokio::spawn(serve_incoming(incoming, dial_timeout));
    }
}

async fn serve_incoming(incoming: IncomingStream, dial_timeout: Duration) {
    let target = incoming.target().to_string();

    let mut local = match tokio::time::timeout(dial_timeout, dial(&target)).await {
        Ok(Ok(local)) => local,
        Ok(Err(e)) => {
            warn!("Failed to reach {}: {}", target, e);
            incoming.reject(&e.to_string());
            return;
        }
        Err(_) => {
            warn!("Dialing {} timed out", target);
            incoming.reject("dial timed out");
            return;
        }
    };

    let mut stream = match incoming.accept() {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Stream to {} gone before accept: {}", target, e);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut stream, &mut local).await {
        Ok((to_target, from_target)) => debug!(
            stream_id = stream.id(),
            bytes_to_target = to_target,
            bytes_from_target = from_target,
            "Forward to {} completed",
            target
        ),
        Err(e) => debug!(stream_id = stream.id(), "Forward to {} ended: {}", target, e),
    }
}

trait LocalIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> LocalIo for T {}

/// Dial a target named in an open request: `unix://path`, `npipe://name` or `host:port`
async fn dial(target: &str) -> std::io::Result<Box<dyn LocalIo>> {
    if let Some(path) = target.strip_prefix("unix://") {
        #[cfg(unix)]
        {
            let stream = tokio::net::UnixStream::connect(path).await?;
            return Ok(Box::new(stream));
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            ));
        }
    }

    if let Some(pipe) = target.strip_prefix("npipe://") {
        #[cfg(windows)]
        {
            let client = tokio::net::windows::named_pipe::ClientOptions::new().open(pipe)?;
            return Ok(Box::new(client));
        }
        #[cfg(not(windows))]
        {
            let _ = pipe;
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "named pipes are not supported on this platform",
            ));
        }
    }

    let stream = TcpStream::connect(target).await?;
    let _ = stream.set_nodelay(true);
    Ok(Box::new(stream))
}
