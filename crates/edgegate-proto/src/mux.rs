//! Multiplexing primitives for the edge tunnel

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

use crate::messages::ControlMessage;

/// Stream identifier
pub type StreamId = u32;

/// Kind of a tunnel frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Control message on stream 0
    Control = 0,
    /// Open request naming a target address (payload), or its acknowledgement (ACK flag)
    Open = 1,
    Data = 2,
    /// Orderly close of a sub-connection
    Close = 3,
    /// Sub-connection failed or was refused; payload carries the reason
    Reset = 4,
    /// Receiver consumed data; payload is the `u32` credit returned to the sender
    WindowUpdate = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Close),
            4 => Ok(FrameType::Reset),
            5 => Ok(FrameType::WindowUpdate),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const ACK: u8 = 0b0000_0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// `u32` stream id, `u8` type, `u8` flags, `u32` payload length
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    /// Control frame carrying an encoded [`ControlMessage`]
    pub fn control(message: &ControlMessage) -> Result<Self, MuxError> {
        let payload = message.to_bytes()?;
        Ok(Self::new(
            crate::CONTROL_STREAM_ID,
            FrameType::Control,
            payload,
        ))
    }

    pub fn open(stream_id: StreamId, target: &str) -> Self {
        Self::new(
            stream_id,
            FrameType::Open,
            Bytes::copy_from_slice(target.as_bytes()),
        )
    }

    pub fn open_ack(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new()).with_flags(FrameFlags::new().with_ack())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn reset(stream_id: StreamId, reason: &str) -> Self {
        Self::new(
            stream_id,
            FrameType::Reset,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Payload interpreted as UTF-8 text (open target or reset reason)
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Credit carried by a window update frame
    pub fn window_increment(&self) -> Result<u32, MuxError> {
        if self.frame_type != FrameType::WindowUpdate {
            return Err(MuxError::UnexpectedFrame(self.frame_type));
        }
        let bytes: [u8; 4] = self.payload[..]
            .try_into()
            .map_err(|_| MuxError::InvalidPayload(self.payload.len()))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Decode the payload of a control frame
    pub fn control_message(&self) -> Result<ControlMessage, MuxError> {
        if self.frame_type != FrameType::Control {
            return Err(MuxError::UnexpectedFrame(self.frame_type));
        }
        ControlMessage::from_bytes(&self.payload)
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one complete frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(MuxError::IncompleteFrame);
        }

        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        if buf.remaining() < length as usize {
            return Err(MuxError::IncompleteFrame);
        }

        let payload = buf.split_to(length as usize);

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        })
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("Invalid payload length: {0} bytes")]
    InvalidPayload(usize),

    #[error("Unexpected frame type: {0:?}")]
    UnexpectedFrame(FrameType),

    #[error("Control message encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Allocates stream ids for one side of a connection
///
/// The server opens odd ids and the agent opens even ids so both sides can
/// open sub-connections without coordinating. Id 0 is never handed out.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: AtomicU32,
}

impl StreamIdAllocator {
    pub fn for_server() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn for_agent() -> Self {
        Self {
            next: AtomicU32::new(2),
        }
    }

    /// Allocate the next stream id, skipping the control stream on wrap-around
    pub fn allocate(&self) -> StreamId {
        loop {
            let id = self.next.fetch_add(2, Ordering::Relaxed);
            if id != crate::CONTROL_STREAM_ID {
                return id;
            }
        }
    }

    /// Whether `id` belongs to the side this allocator serves
    pub fn owns(&self, id: StreamId) -> bool {
        id != crate::CONTROL_STREAM_ID && id % 2 == self.next.load(Ordering::Relaxed) % 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_keeps_stream_and_payload() {
        let body = Bytes::from_static(b"GET /_ping HTTP/1.1\r\n\r\n");
        let wire = Frame::data(9, body.clone()).encode().unwrap();
        assert_eq!(wire.len(), Frame::HEADER_SIZE + body.len());

        let frame = Frame::decode(wire).unwrap();
        assert_eq!(
            (frame.stream_id, frame.frame_type, frame.payload),
            (9, FrameType::Data, body)
        );
    }

    #[test]
    fn test_open_ack_flag_survives_encoding() {
        let frame = Frame::open_ack(7);
        assert!(frame.flags.has_ack());

        let decoded = Frame::decode(frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Open);
        assert!(decoded.flags.has_ack());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_open_carries_target() {
        let frame = Frame::open(3, "unix:///var/run/docker.sock");
        assert_eq!(frame.payload_text(), "unix:///var/run/docker.sock");
        assert!(!frame.flags.has_ack());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        buf.put_u8(0);
        buf.put_u32(0);

        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, MuxError::InvalidFrameType(99)));
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::data(1, Bytes::from_static(b"abcdef"));
        let encoded = frame.encode().unwrap();
        let truncated = encoded.slice(..encoded.len() - 2);
        assert!(matches!(
            Frame::decode(truncated),
            Err(MuxError::IncompleteFrame)
        ));
    }

    #[test]
    fn test_window_update_carries_increment() {
        let decoded = Frame::decode(Frame::window_update(5, 65_536).encode().unwrap()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert_eq!(decoded.window_increment().unwrap(), 65_536);

        let short = Frame::new(5, FrameType::WindowUpdate, Bytes::from_static(b"ab"));
        assert!(matches!(
            short.window_increment(),
            Err(MuxError::InvalidPayload(2))
        ));
    }

    #[test]
    fn test_control_message_requires_control_frame() {
        let frame = Frame::data(1, Bytes::new());
        assert!(matches!(
            frame.control_message(),
            Err(MuxError::UnexpectedFrame(FrameType::Data))
        ));
    }

    #[test]
    fn test_allocator_parity() {
        let server = StreamIdAllocator::for_server();
        let agent = StreamIdAllocator::for_agent();

        let s1 = server.allocate();
        let s2 = server.allocate();
        let a1 = agent.allocate();

        assert_eq!(s1 % 2, 1);
        assert_eq!(s2 % 2, 1);
        assert_ne!(s1, s2);
        assert_eq!(a1 % 2, 0);
        assert_ne!(a1, crate::CONTROL_STREAM_ID);

        assert!(server.owns(s1));
        assert!(!server.owns(a1));
        assert!(agent.owns(a1));
        assert!(!agent.owns(crate::CONTROL_STREAM_ID));
    }
}
