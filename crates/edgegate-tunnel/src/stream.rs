//! Logical sub-connection over a multiplexed tunnel
//!
//! Each direction of a stream is credit based: a sender may have at most
//! [`STREAM_WINDOW`] bytes in flight, and the receiver hands credit back with
//! window updates as the application consumes data. A stream nobody reads
//! therefore stalls its writer instead of growing queues on either side.

use bytes::Bytes;
use edgegate_proto::{Frame, StreamId, STREAM_WINDOW};
use futures::task::AtomicWaker;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::StreamTable;

/// Largest payload carried by a single data frame
const MAX_DATA_CHUNK: usize = 64 * 1024;

/// Consumed bytes batched into one window update
const WINDOW_UPDATE_THRESHOLD: usize = STREAM_WINDOW as usize / 4;

/// Event delivered by the connection reader to one stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    /// Peer closed its write half
    Eof,
    Reset(String),
}

/// Credit the local writer may still spend on one stream
#[derive(Debug)]
pub(crate) struct SendWindow {
    available: AtomicUsize,
    closed: AtomicBool,
    waker: AtomicWaker,
}

impl SendWindow {
    fn new() -> Self {
        Self {
            available: AtomicUsize::new(STREAM_WINDOW as usize),
            closed: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    /// Take up to `max` bytes of credit; `None` once the stream is reset
    fn poll_take(&self, cx: &mut Context<'_>, max: usize) -> Poll<Option<usize>> {
        let mut available = self.available.load(Ordering::Acquire);
        if available == 0 {
            self.waker.register(cx.waker());
            available = self.available.load(Ordering::Acquire);
        }
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        if available == 0 {
            return Poll::Pending;
        }

        // Only the owning stream takes credit, so `available` cannot shrink under us
        let n = available.min(max);
        self.available.fetch_sub(n, Ordering::AcqRel);
        Poll::Ready(Some(n))
    }

    fn grant(&self, increment: usize) {
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(increment))
            });
        self.waker.wake();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// Reader-task side of one stream
#[derive(Debug)]
pub(crate) struct StreamSlot {
    events: mpsc::UnboundedSender<StreamEvent>,
    window: Arc<SendWindow>,
    unread: Arc<AtomicUsize>,
}

/// Stream side of a [`StreamSlot`], consumed by [`MuxStream::new`]
#[derive(Debug)]
pub(crate) struct SlotReceiver {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    window: Arc<SendWindow>,
    unread: Arc<AtomicUsize>,
}

impl StreamSlot {
    pub(crate) fn new() -> (Self, SlotReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let window = Arc::new(SendWindow::new());
        let unread = Arc::new(AtomicUsize::new(0));
        (
            Self {
                events: tx,
                window: window.clone(),
                unread: unread.clone(),
            },
            SlotReceiver {
                events: rx,
                window,
                unread,
            },
        )
    }

    /// Queue inbound data; `false` when the peer overran its window
    pub(crate) fn deliver(&self, data: Bytes) -> bool {
        let queued = self.unread.fetch_add(data.len(), Ordering::AcqRel) + data.len();
        if queued > STREAM_WINDOW as usize {
            return false;
        }
        let _ = self.events.send(StreamEvent::Data(data));
        true
    }

    pub(crate) fn finish(&self) {
        let _ = self.events.send(StreamEvent::Eof);
    }

    pub(crate) fn reset(&self, reason: &str) {
        self.window.close();
        let _ = self.events.send(StreamEvent::Reset(reason.to_string()));
    }

    /// Return send credit granted by the peer
    pub(crate) fn grant(&self, increment: u32) {
        self.window.grant(increment as usize);
    }
}

/// A sub-connection of a [`MuxConnection`](crate::MuxConnection)
///
/// Reads yield the peer's data frames until the peer closes its half; writes
/// are chunked into data frames and wait while the peer has not consumed
/// earlier data. `shutdown` closes the local half. Dropping the stream before
/// both halves are closed resets it on the peer, which releases whatever the
/// peer had bound to it.
#[derive(Debug)]
pub struct MuxStream {
    id: StreamId,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    window: Arc<SendWindow>,
    unread: Arc<AtomicUsize>,
    frames: mpsc::UnboundedSender<Frame>,
    streams: Arc<StreamTable>,
    buffered: Option<Bytes>,
    unacked: usize,
    read_closed: bool,
    write_closed: bool,
    reset: bool,
}

impl MuxStream {
    pub(crate) fn new(
        id: StreamId,
        slot: SlotReceiver,
        frames: mpsc::UnboundedSender<Frame>,
        streams: Arc<StreamTable>,
    ) -> Self {
        Self {
            id,
            rx: slot.events,
            window: slot.window,
            unread: slot.unread,
            frames,
            streams,
            buffered: None,
            unacked: 0,
            read_closed: false,
            write_closed: false,
            reset: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Hand consumed bytes back to the peer as send credit
    fn release(&mut self, n: usize) {
        self.unacked += n;
        if self.unacked < WINDOW_UPDATE_THRESHOLD {
            return;
        }
        self.unread.fetch_sub(self.unacked, Ordering::AcqRel);
        let _ = self
            .frames
            .send(Frame::window_update(self.id, self.unacked as u32));
        self.unacked = 0;
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if let Some(chunk) = this.buffered.as_mut() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk.split_to(n));
                if chunk.is_empty() {
                    this.buffered = None;
                }
                this.release(n);
                return Poll::Ready(Ok(()));
            }

            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(StreamEvent::Data(bytes)) => {
                    if !bytes.is_empty() {
                        this.buffered = Some(bytes);
                    }
                }
                Some(StreamEvent::Reset(reason)) => {
                    this.read_closed = true;
                    this.write_closed = true;
                    this.reset = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        reason,
                    )));
                }
                Some(StreamEvent::Eof) | None => {
                    trace!("Stream {} closed by peer", this.id);
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_closed {
            let kind = if this.reset {
                io::ErrorKind::ConnectionReset
            } else {
                io::ErrorKind::BrokenPipe
            };
            return Poll::Ready(Err(io::Error::new(kind, "stream closed for writing")));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = match this.window.poll_take(cx, buf.len().min(MAX_DATA_CHUNK)) {
            Poll::Ready(Some(n)) => n,
            Poll::Ready(None) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset",
                )))
            }
            Poll::Pending => {
                trace!("Stream {} waiting for send window", this.id);
                return Poll::Pending;
            }
        };

        this.frames
            .send(Frame::data(this.id, Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed"))?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            // A dead tunnel has nothing left to close
            let _ = this.frames.send(Frame::close(this.id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.streams.remove(&self.id);

        if self.reset {
            return;
        }

        let frame = match (self.read_closed, self.write_closed) {
            (true, true) => return,
            (true, false) => Frame::close(self.id),
            _ => Frame::reset(self.id, "stream dropped"),
        };
        let _ = self.frames.send(frame);
    }
}
