//! # Relay Envelope
//!
//! Wire envelope shared by the voxrelay transport layer and its clients.
//!
//! Every message on the wire is a single frame:
//!
//! ```text
//! u32 frame length (big endian, excludes itself)
//! u16 magic "VR"
//! u8  version
//! u8  message kind (REQUEST | REPLY | EVENT)
//! i64 timestamp (unix millis)
//! str correlation id
//! opt job id
//! opt stage
//! opt error (u8 code + str message)
//! u32 payload length + payload bytes
//! ```
//!
//! The envelope never interprets the payload; callers pick their own payload
//! encoding (voxrelay uses JSON).

pub mod codec;
pub mod de;
pub mod error;
pub mod ser;
pub mod types;

pub use crate::{
    codec::EnvelopeCodec,
    error::EnvelopeError,
    types::{Envelope, ErrorCode, MessageKind, WireError},
};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Magic prefix of every frame body.
pub const MAGIC: u16 = 0x5652;

/// Current envelope format version.
pub const VERSION: u8 = 1;

/// Default upper bound for a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a single envelope into a standalone frame.
pub fn encode_frame(envelope: Envelope) -> Result<BytesMut, EnvelopeError> {
    let mut codec = EnvelopeCodec::default();
    let mut dst = BytesMut::new();
    codec.encode(envelope, &mut dst)?;
    Ok(dst)
}

/// Decode one envelope from the front of `src`, if a full frame is buffered.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Envelope>, EnvelopeError> {
    let mut codec = EnvelopeCodec::default();
    codec.decode(src)
}
