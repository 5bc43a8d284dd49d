//! Protocol module - length-prefixed framing.
//!
//! This module implements the wire framing shared by all connections:
//! - 1, 2 or 4 byte length header in either byte order
//! - Frame codec with bounds checks on both read and write

mod frame_codec;
mod wire_format;

pub use frame_codec::FrameCodec;
pub use wire_format::{decode_len, encode_len, ByteOrder, HeaderWidth, MAX_HEADER_SIZE};
