//! Wire format encoding and decoding.
//!
//! Every frame is a length header followed by the payload:
//! ```text
//! ┌──────────────────┬──────────────────────┐
//! │ Length           │ Payload              │
//! │ 1, 2 or 4 bytes  │ min..=max bytes      │
//! │ uint, BE or LE   │                      │
//! └──────────────────┴──────────────────────┘
//! ```
//!
//! The header encodes the payload length only.

use bytes::{Buf, BufMut};

use crate::error::{GateError, Result};

/// Widest supported header, in bytes.
pub const MAX_HEADER_SIZE: usize = 4;

/// Width of the length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderWidth {
    /// One byte, payloads up to 255 bytes.
    One,
    /// Two bytes, payloads up to 65535 bytes.
    Two,
    /// Four bytes, payloads up to `u32::MAX` bytes.
    Four,
}

impl HeaderWidth {
    /// Map a configured header width in bytes.
    ///
    /// Anything other than 1, 2 or 4 is a configuration error.
    pub fn from_len(len: usize) -> Result<Self> {
        match len {
            1 => Ok(HeaderWidth::One),
            2 => Ok(HeaderWidth::Two),
            4 => Ok(HeaderWidth::Four),
            other => Err(GateError::Config(format!(
                "invalid length header width {}, expected 1, 2 or 4",
                other
            ))),
        }
    }

    /// Header width in bytes.
    #[inline]
    pub fn len(self) -> usize {
        match self {
            HeaderWidth::One => 1,
            HeaderWidth::Two => 2,
            HeaderWidth::Four => 4,
        }
    }

    /// Largest payload length the header can express.
    #[inline]
    pub fn max_payload(self) -> u32 {
        match self {
            HeaderWidth::One => u8::MAX as u32,
            HeaderWidth::Two => u16::MAX as u32,
            HeaderWidth::Four => u32::MAX,
        }
    }
}

/// Byte order of the length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Pick the order from a `little_endian` config flag.
    #[inline]
    pub fn from_little_endian(little_endian: bool) -> Self {
        if little_endian {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }
}

/// Append a length header to `out`.
///
/// `len` must already fit in `width`; callers check it against
/// [`HeaderWidth::max_payload`] first.
pub fn encode_len<B: BufMut>(len: u32, width: HeaderWidth, order: ByteOrder, out: &mut B) {
    match (width, order) {
        (HeaderWidth::One, _) => out.put_u8(len as u8),
        (HeaderWidth::Two, ByteOrder::BigEndian) => out.put_u16(len as u16),
        (HeaderWidth::Two, ByteOrder::LittleEndian) => out.put_u16_le(len as u16),
        (HeaderWidth::Four, ByteOrder::BigEndian) => out.put_u32(len),
        (HeaderWidth::Four, ByteOrder::LittleEndian) => out.put_u32_le(len),
    }
}

/// Decode a length header.
///
/// Returns an error if `buf` is shorter than the header width.
pub fn decode_len(mut buf: &[u8], width: HeaderWidth, order: ByteOrder) -> Result<u32> {
    if buf.len() < width.len() {
        return Err(GateError::InvalidData(format!(
            "length header needs {} bytes, got {}",
            width.len(),
            buf.len()
        )));
    }

    let len = match (width, order) {
        (HeaderWidth::One, _) => buf.get_u8() as u32,
        (HeaderWidth::Two, ByteOrder::BigEndian) => buf.get_u16() as u32,
        (HeaderWidth::Two, ByteOrder::LittleEndian) => buf.get_u16_le() as u32,
        (HeaderWidth::Four, ByteOrder::BigEndian) => buf.get_u32(),
        (HeaderWidth::Four, ByteOrder::LittleEndian) => buf.get_u32_le(),
    };
    Ok(len)
}
