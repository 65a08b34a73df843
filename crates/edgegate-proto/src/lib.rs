//! Edge tunnel protocol definitions
//!
//! Wire format shared by the tunnel server and edge agents: a stream of
//! length-prefixed frames, where stream 0 carries control messages and every
//! other stream id is one logical sub-connection.

pub mod codec;
pub mod messages;
pub mod mux;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;
pub use mux::{Frame, FrameFlags, FrameType, MuxError, StreamId, StreamIdAllocator};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: u32 = 0;

/// Bytes a sender may have in flight on one stream before the receiver
/// grants more with a window update
pub const STREAM_WINDOW: u32 = 256 * 1024;
