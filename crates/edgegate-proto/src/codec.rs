//! Codec for framing the tunnel byte stream

use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::mux::{Frame, MuxError};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] MuxError),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Tunnel frame codec
///
/// Format: `[stream_id: u32][type: u8][flags: u8][length: u32][payload]`, big-endian.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: crate::MAX_FRAME_SIZE as usize,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[6..10]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(length));
        }

        if src.len() < Frame::HEADER_SIZE + length {
            src.reserve(Frame::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        let wire = src.split_to(Frame::HEADER_SIZE + length).freeze();
        Ok(Some(Frame::decode(wire)?))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        if frame.payload.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(frame.payload.len()));
        }
        frame.encode_into(dst)?;
        Ok(())
    }
}
