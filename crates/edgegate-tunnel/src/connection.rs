//! Multiplexed tunnel connection
//!
//! One physical byte stream carries a control channel (stream 0) and any
//! number of independent sub-connections. A writer task drains an outbound
//! frame queue into the socket; a reader task dispatches inbound frames to the
//! control channel, to pending opens, or to the owning [`MuxStream`].
//! Window updates from the peer replenish the send credit of their stream.

use dashmap::DashMap;
use edgegate_proto::{
    CodecError, ControlMessage, Frame, FrameCodec, FrameType, MuxError, StreamId,
    StreamIdAllocator,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::stream::{MuxStream, SlotReceiver, StreamSlot};

pub(crate) type StreamTable = DashMap<StreamId, StreamSlot>;
type PendingOpens = DashMap<StreamId, oneshot::Sender<Result<(), String>>>;

/// Control messages received from the peer
pub type ControlReceiver = mpsc::UnboundedReceiver<ControlMessage>;

/// Which end of the tunnel this connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Agent,
}

/// Tunnel connection errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel connection closed")]
    ConnectionClosed,

    #[error("Sub-connection to '{target}' refused: {reason}")]
    OpenRefused { target: String, reason: String },

    #[error("Sub-connection to '{target}' not acknowledged within {timeout:?}")]
    OpenTimeout { target: String, timeout: Duration },

    #[error("Frame error: {0}")]
    Frame(#[from] MuxError),
}

/// Multiplexed connection shared by every user of one tunnel
pub struct MuxConnection {
    connection_id: String,
    role: Role,
    frames: mpsc::UnboundedSender<Frame>,
    streams: Arc<StreamTable>,
    pending: Arc<PendingOpens>,
    incoming: Mutex<mpsc::UnboundedReceiver<IncomingStream>>,
    ids: Arc<StreamIdAllocator>,
    closed: CancellationToken,
    created_at: Instant,
    last_frame_ms: Arc<AtomicU64>,
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("streams", &self.streams.len())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl MuxConnection {
    /// Start multiplexing over an established, already handshaken connection
    ///
    /// Frames already buffered in `framed` are processed first.
    pub fn from_framed<T>(framed: Framed<T, FrameCodec>, role: Role) -> (Arc<Self>, ControlReceiver)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection_id = format!("mux-{}", uuid::Uuid::new_v4());
        let (sink, source) = framed.split();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let ids = Arc::new(match role {
            Role::Server => StreamIdAllocator::for_server(),
            Role::Agent => StreamIdAllocator::for_agent(),
        });

        let conn = Arc::new(Self {
            connection_id: connection_id.clone(),
            role,
            frames: frame_tx.clone(),
            streams: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            incoming: Mutex::new(incoming_rx),
            ids: ids.clone(),
            closed: CancellationToken::new(),
            created_at: Instant::now(),
            last_frame_ms: Arc::new(AtomicU64::new(0)),
        });

        tokio::spawn(write_loop(
            sink,
            frame_rx,
            conn.closed.clone(),
            connection_id.clone(),
        ));

        let reader = Reader {
            connection_id,
            frames: frame_tx,
            streams: conn.streams.clone(),
            pending: conn.pending.clone(),
            ids,
            control_tx,
            incoming_tx,
            closed: conn.closed.clone(),
            created_at: conn.created_at,
            last_frame_ms: conn.last_frame_ms.clone(),
        };
        tokio::spawn(reader.run(source));

        (conn, control_rx)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Open a sub-connection to `target` inside the peer's network
    ///
    /// Resolves once the peer acknowledges that it reached the target, fails
    /// if the peer refuses or does not answer within `timeout`.
    pub async fn open_stream(&self, target: &str, timeout: Duration) -> Result<MuxStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }

        let id = self.ids.allocate();
        let (slot, receiver) = StreamSlot::new();
        let (ack_tx, ack_rx) = oneshot::channel();

        self.streams.insert(id, slot);
        self.pending.insert(id, ack_tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            id,
        };
        let stream = MuxStream::new(id, receiver, self.frames.clone(), self.streams.clone());

        self.frames
            .send(Frame::open(id, target))
            .map_err(|_| TunnelError::ConnectionClosed)?;

        // Teardown may have cleared the pending table before our entry went in
        let acked = tokio::select! {
            acked = tokio::time::timeout(timeout, ack_rx) => acked,
            _ = self.closed.cancelled() => return Err(TunnelError::ConnectionClosed),
        };

        match acked {
            Ok(Ok(Ok(()))) => {
                debug!("[{}] Opened stream {} to {}", self.connection_id, id, target);
                Ok(stream)
            }
            Ok(Ok(Err(reason))) => Err(TunnelError::OpenRefused {
                target: target.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
            Err(_) => {
                warn!(
                    "[{}] Stream {} to {} not acknowledged within {:?}",
                    self.connection_id, id, target, timeout
                );
                Err(TunnelError::OpenTimeout {
                    target: target.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Wait for the peer to open a sub-connection
    ///
    /// Returns `None` once the connection is closed.
    pub async fn accept(&self) -> Option<IncomingStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream,
            _ = self.closed.cancelled() => None,
        }
    }

    pub fn send_control(&self, message: &ControlMessage) -> Result<(), TunnelError> {
        let frame = Frame::control(message)?;
        self.frames
            .send(frame)
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Send a disconnect notice, then close
    pub fn close_with_reason(&self, reason: &str) {
        if !self.is_closed() {
            let _ = self.send_control(&ControlMessage::Disconnect {
                reason: reason.to_string(),
            });
        }
        self.close();
    }

    /// Close the connection and every sub-connection on it
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("[{}] Closing tunnel connection", self.connection_id);
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has closed for any reason
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of open sub-connections
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Time since the last frame of any kind was received
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_frame_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

struct PendingGuard<'a> {
    pending: &'a PendingOpens,
    id: StreamId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// A sub-connection opened by the peer, not yet accepted
#[derive(Debug)]
pub struct IncomingStream {
    id: StreamId,
    target: String,
    rx: Option<SlotReceiver>,
    frames: mpsc::UnboundedSender<Frame>,
    streams: Arc<StreamTable>,
}

impl IncomingStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Address the peer asked to reach
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Acknowledge the open and start exchanging data
    pub fn accept(mut self) -> Result<MuxStream, TunnelError> {
        let rx = self.rx.take().ok_or(TunnelError::ConnectionClosed)?;
        self.frames
            .send(Frame::open_ack(self.id))
            .map_err(|_| TunnelError::ConnectionClosed)?;
        Ok(MuxStream::new(
            self.id,
            rx,
            self.frames.clone(),
            self.streams.clone(),
        ))
    }

    /// Refuse the open; the peer's `open_stream` fails with `reason`
    pub fn reject(mut self, reason: &str) {
        self.refuse(reason);
    }

    fn refuse(&mut self, reason: &str) {
        if self.rx.take().is_some() {
            self.streams.remove(&self.id);
            let _ = self.frames.send(Frame::reset(self.id, reason));
        }
    }
}

impl Drop for IncomingStream {
    fn drop(&mut self) {
        self.refuse("not accepted");
    }
}

async fn write_loop<K>(
    mut sink: K,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
    connection_id: String,
) where
    K: Sink<Frame, Error = CodecError> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.cancelled() => break,
        };

        if let Err(e) = sink.feed(frame).await {
            error!("[{}] Tunnel write error: {}", connection_id, e);
            break;
        }
        // Batch whatever is already queued into one flush
        let mut failed = false;
        while let Ok(frame) = rx.try_recv() {
            if let Err(e) = sink.feed(frame).await {
                error!("[{}] Tunnel write error: {}", connection_id, e);
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }
        if let Err(e) = sink.flush().await {
            error!("[{}] Tunnel flush error: {}", connection_id, e);
            break;
        }
    }

    debug!("[{}] Tunnel writer task ended", connection_id);
    closed.cancel();
    let _ = sink.close().await;
}

struct Reader {
    connection_id: String,
    frames: mpsc::UnboundedSender<Frame>,
    streams: Arc<StreamTable>,
    pending: Arc<PendingOpens>,
    ids: Arc<StreamIdAllocator>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    incoming_tx: mpsc::UnboundedSender<IncomingStream>,
    closed: CancellationToken,
    created_at: Instant,
    last_frame_ms: Arc<AtomicU64>,
}

impl Reader {
    async fn run<S>(self, mut source: S)
    where
        S: Stream<Item = Result<Frame, CodecError>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                next = source.next() => next,
                _ = self.closed.cancelled() => break,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    error!("[{}] Tunnel read error: {}", self.connection_id, e);
                    break;
                }
                None => {
                    debug!("[{}] Tunnel closed by peer", self.connection_id);
                    break;
                }
            };

            self.last_frame_ms.store(
                self.created_at.elapsed().as_millis() as u64,
                Ordering::Relaxed,
            );
            self.dispatch(frame);
        }

        self.closed.cancel();
        self.teardown();
        debug!("[{}] Tunnel reader task ended", self.connection_id);
    }

    fn dispatch(&self, frame: Frame) {
        let id = frame.stream_id;
        trace!(
            "[{}] Received frame: stream={}, type={:?}, len={}",
            self.connection_id,
            id,
            frame.frame_type,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Control => match frame.control_message() {
                Ok(message) => {
                    if self.control_tx.send(message).is_err() {
                        trace!("[{}] Control receiver gone", self.connection_id);
                    }
                }
                Err(e) => warn!("[{}] Undecodable control frame: {}", self.connection_id, e),
            },
            FrameType::Open if frame.flags.has_ack() => {
                if let Some((_, ack)) = self.pending.remove(&id) {
                    let _ = ack.send(Ok(()));
                }
            }
            FrameType::Open => self.open_incoming(id, frame.payload_text()),
            FrameType::Data => {
                let within_window = match self.streams.get(&id) {
                    Some(slot) => slot.deliver(frame.payload),
                    None => {
                        trace!("[{}] Data for unknown stream {}", self.connection_id, id);
                        true
                    }
                };
                if !within_window {
                    warn!("[{}] Peer overran the window of stream {}", self.connection_id, id);
                    self.reset_stream(id, "flow control window exceeded");
                }
            }
            FrameType::WindowUpdate => match frame.window_increment() {
                Ok(increment) => {
                    if let Some(slot) = self.streams.get(&id) {
                        slot.grant(increment);
                    }
                }
                Err(e) => warn!("[{}] Malformed window update: {}", self.connection_id, e),
            },
            FrameType::Close => {
                // The slot stays until the stream is dropped, our half may still be writing
                if let Some(slot) = self.streams.get(&id) {
                    slot.finish();
                }
            }
            FrameType::Reset => {
                let reason = frame.payload_text();
                if let Some((_, ack)) = self.pending.remove(&id) {
                    let _ = ack.send(Err(reason.clone()));
                }
                if let Some((_, slot)) = self.streams.remove(&id) {
                    slot.reset(&reason);
                }
            }
        }
    }

    /// Fail one stream locally and on the peer
    fn reset_stream(&self, id: StreamId, reason: &str) {
        if let Some((_, slot)) = self.streams.remove(&id) {
            slot.reset(reason);
        }
        let _ = self.frames.send(Frame::reset(id, reason));
    }

    fn open_incoming(&self, id: StreamId, target: String) {
        if id == edgegate_proto::CONTROL_STREAM_ID || self.ids.owns(id) || self.streams.contains_key(&id) {
            warn!("[{}] Peer opened invalid stream id {}", self.connection_id, id);
            let _ = self.frames.send(Frame::reset(id, "invalid stream id"));
            return;
        }

        let (slot, rx) = StreamSlot::new();
        self.streams.insert(id, slot);
        debug!("[{}] Peer opened stream {} to {}", self.connection_id, id, target);

        let incoming = IncomingStream {
            id,
            target,
            rx: Some(rx),
            frames: self.frames.clone(),
            streams: self.streams.clone(),
        };
        // A refused send drops the stream, which resets it
        let _ = self.incoming_tx.send(incoming);
    }

    fn teardown(&self) {
        // Dropping the senders fails every pending open with ConnectionClosed
        self.pending.clear();

        for entry in self.streams.iter() {
            entry.value().reset("tunnel closed");
        }
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use edgegate_proto::STREAM_WINDOW;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn pair() -> (
        (Arc<MuxConnection>, ControlReceiver),
        (Arc<MuxConnection>, ControlReceiver),
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            MuxConnection::from_framed(Framed::new(a, FrameCodec::new()), Role::Server),
            MuxConnection::from_framed(Framed::new(b, FrameCodec::new()), Role::Agent),
        )
    }

    #[tokio::test]
    async fn test_open_accept_and_exchange() {
        let ((server, _), (agent, _)) = pair();

        let agent_side = tokio::spawn(async move {
            let incoming = agent.accept().await.unwrap();
            assert_eq!(incoming.target(), "127.0.0.1:2375");
            let mut stream = incoming.accept().unwrap();

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream.shutdown().await.unwrap();
            agent
        });

        let mut stream = server
            .open_stream("127.0.0.1:2375", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stream.id() % 2, 1);

        stream.write_all(b"ping").await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let _agent = agent_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_open_is_isolated() {
        let ((server, _), (agent, _)) = pair();

        tokio::spawn(async move {
            while let Some(incoming) = agent.accept().await {
                if incoming.target() == "bad:1" {
                    incoming.reject("connection refused");
                } else if let Ok(mut stream) = incoming.accept() {
                    tokio::spawn(async move {
                        let mut buf = Vec::new();
                        let _ = stream.read_to_end(&mut buf).await;
                        let _ = stream.write_all(&buf).await;
                        let _ = stream.shutdown().await;
                    });
                }
            }
        });

        let err = server
            .open_stream("bad:1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::OpenRefused { ref reason, .. } if reason == "connection refused"));

        let mut ok = server
            .open_stream("good:1", Duration::from_secs(1))
            .await
            .unwrap();
        ok.write_all(b"echo").await.unwrap();
        ok.shutdown().await.unwrap();
        let mut reply = Vec::new();
        ok.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"echo");
    }

    #[tokio::test]
    async fn test_open_times_out_without_ack() {
        let ((server, _), (_agent, _)) = pair();

        let err = server
            .open_stream("10.0.0.1:2375", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::OpenTimeout { .. }));
        assert_eq!(server.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_control_messages_delivered() {
        let ((server, mut server_control), (agent, _)) = pair();

        agent
            .send_control(&ControlMessage::Heartbeat { timestamp: 7 })
            .unwrap();
        let msg = server_control.recv().await.unwrap();
        assert_eq!(msg, ControlMessage::Heartbeat { timestamp: 7 });
        assert!(server.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_close_resets_open_streams() {
        let ((server, _), (agent, mut agent_control)) = pair();

        let agent_task = tokio::spawn(async move {
            let incoming = agent.accept().await.unwrap();
            let _stream = incoming.accept().unwrap();
            agent.closed().await;
        });

        let mut stream = server
            .open_stream("127.0.0.1:1", Duration::from_secs(1))
            .await
            .unwrap();

        server.close_with_reason("shutting down");

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        tokio::time::timeout(Duration::from_secs(1), agent_task)
            .await
            .unwrap()
            .unwrap();
        // Agent either saw the notice or just the closed socket
        let _ = agent_control.try_recv();
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_peer_side() {
        let ((server, _), (agent, _)) = pair();

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let incoming = agent.accept().await.unwrap();
            let mut stream = incoming.accept().unwrap();
            let mut buf = [0u8; 8];
            let result = stream.read(&mut buf).await;
            let _ = done_tx.send(result.map_err(|e| e.kind()));
            agent
        });

        let stream = server
            .open_stream("127.0.0.1:1", Duration::from_secs(1))
            .await
            .unwrap();
        drop(stream);

        let result = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(std::io::ErrorKind::ConnectionReset));
        assert_eq!(server.active_streams(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unread_stream_stalls_writer_and_spares_siblings() {
        let ((server, _), (agent, _)) = pair();

        let (peers_tx, mut peers_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(incoming) = agent.accept().await {
                if let Ok(stream) = incoming.accept() {
                    let _ = peers_tx.send(stream);
                }
            }
        });

        let mut stalled = server
            .open_stream("stalled:1", Duration::from_secs(1))
            .await
            .unwrap();
        let mut stalled_peer = peers_rx.recv().await.unwrap();

        let payload = vec![7u8; 4 * 1024 * 1024];
        let writer = tokio::spawn(async move {
            stalled.write_all(&payload).await.unwrap();
            stalled.shutdown().await.unwrap();
            stalled
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished(), "write to an unread stream completed");

        let mut sibling = server
            .open_stream("sibling:1", Duration::from_secs(1))
            .await
            .unwrap();
        let mut sibling_peer = peers_rx.recv().await.unwrap();
        sibling.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(1), sibling_peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");

        let mut received = Vec::new();
        timeout(Duration::from_secs(10), stalled_peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 4 * 1024 * 1024);
        let _stalled = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_overrunning_window_is_reset() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (server, _control) =
            MuxConnection::from_framed(Framed::new(a, FrameCodec::new()), Role::Server);
        let mut raw = Framed::new(b, FrameCodec::new());

        raw.send(Frame::open(2, "127.0.0.1:2375")).await.unwrap();
        let mut stream = server.accept().await.unwrap().accept().unwrap();
        let ack = raw.next().await.unwrap().unwrap();
        assert!(ack.flags.has_ack());

        let chunk = Bytes::from(vec![1u8; 64 * 1024]);
        for _ in 0..5 {
            raw.send(Frame::data(2, chunk.clone())).await.unwrap();
        }

        let reset = timeout(Duration::from_secs(1), raw.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reset.frame_type, FrameType::Reset);
        assert_eq!(reset.payload_text(), "flow control window exceeded");

        // Data inside the window is still readable before the reset surfaces
        let mut received = 0;
        let mut buf = vec![0u8; 64 * 1024];
        let err = loop {
            match stream.read(&mut buf).await {
                Ok(0) => panic!("stream ended without a reset"),
                Ok(n) => received += n,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert_eq!(received, STREAM_WINDOW as usize);
    }

    #[tokio::test]
    async fn test_pending_open_fails_when_connection_closes() {
        let ((server, _), (_agent, _)) = pair();

        let opener = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .open_stream("10.0.0.1:2375", Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();

        let result = timeout(Duration::from_secs(1), opener)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TunnelError::ConnectionClosed)));

        let err = server
            .open_stream("10.0.0.1:2375", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ConnectionClosed));
    }
}
