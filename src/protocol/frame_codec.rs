//! Length-prefixed frame codec.
//!
//! A [`FrameCodec`] is built once per server or client from a
//! [`FrameConfig`] and shared by every connection. It is `Copy`, holds no
//! buffers, and reads or writes directly against any tokio stream.
//!
//! # Example
//!
//! ```
//! use wiregate::config::FrameConfig;
//! use wiregate::protocol::FrameCodec;
//!
//! let codec = FrameCodec::new(&FrameConfig::default()).unwrap();
//! let frame = codec.encode(&[b"hello ", b"world"]).unwrap();
//!
//! assert_eq!(&frame[..2], &[0, 11]);
//! assert_eq!(&frame[2..], b"hello world");
//! ```

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire_format::{decode_len, encode_len, ByteOrder, HeaderWidth, MAX_HEADER_SIZE};
use crate::config::FrameConfig;
use crate::error::{GateError, Result};

/// Reads and writes length-prefixed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    width: HeaderWidth,
    min_msg_len: u32,
    max_msg_len: u32,
    byte_order: ByteOrder,
}

impl FrameCodec {
    /// Build a codec from configuration.
    ///
    /// # Errors
    ///
    /// Returns `GateError::Config` if the header width is not 1, 2 or 4, or
    /// if the minimum length exceeds the (clamped) maximum.
    pub fn new(config: &FrameConfig) -> Result<Self> {
        let width = HeaderWidth::from_len(config.len_msg_len)?;

        let mut max_msg_len = config.max_msg_len;
        if max_msg_len > width.max_payload() {
            tracing::warn!(
                max_msg_len,
                header_width = width.len(),
                clamped = width.max_payload(),
                "max_msg_len exceeds header capacity, clamping"
            );
            max_msg_len = width.max_payload();
        }

        if config.min_msg_len > max_msg_len {
            return Err(GateError::Config(format!(
                "min_msg_len {} exceeds max_msg_len {}",
                config.min_msg_len, max_msg_len
            )));
        }

        Ok(Self {
            width,
            min_msg_len: config.min_msg_len,
            max_msg_len,
            byte_order: ByteOrder::from_little_endian(config.little_endian),
        })
    }

    /// Header width in bytes.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.width.len()
    }

    /// Smallest accepted payload length.
    #[inline]
    pub fn min_msg_len(&self) -> u32 {
        self.min_msg_len
    }

    /// Largest accepted payload length.
    #[inline]
    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    /// Header byte order.
    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Check a payload length against the configured bounds.
    pub fn check_len(&self, len: u64) -> Result<()> {
        if len > self.max_msg_len as u64 {
            return Err(GateError::MessageTooLong {
                len,
                max: self.max_msg_len,
            });
        }
        if len < self.min_msg_len as u64 {
            return Err(GateError::MessageTooShort {
                len: len as u32,
                min: self.min_msg_len,
            });
        }
        Ok(())
    }

    /// Read one frame and return its payload.
    ///
    /// Any short read is an error; the stream is unusable afterwards.
    pub async fn read<R>(&self, reader: &mut R) -> Result<Bytes>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; MAX_HEADER_SIZE];
        let header = &mut header[..self.width.len()];
        reader.read_exact(header).await?;

        let len = decode_len(header, self.width, self.byte_order)?;
        self.check_len(len as u64)?;

        let mut payload = BytesMut::zeroed(len as usize);
        reader.read_exact(&mut payload).await?;

        Ok(payload.freeze())
    }

    /// Encode one frame from one or more payload segments.
    ///
    /// The segments are concatenated behind a single header, so the result
    /// is delivered as one frame.
    pub fn encode(&self, segments: &[&[u8]]) -> Result<Bytes> {
        let total: u64 = segments.iter().map(|s| s.len() as u64).sum();
        self.check_len(total)?;

        let mut frame = BytesMut::with_capacity(self.width.len() + total as usize);
        encode_len(total as u32, self.width, self.byte_order, &mut frame);
        for segment in segments {
            frame.extend_from_slice(segment);
        }

        Ok(frame.freeze())
    }

    /// Encode one frame and write it with a single `write_all`.
    pub async fn write<W>(&self, writer: &mut W, segments: &[&[u8]]) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = self.encode(segments)?;
        writer.write_all(&frame).await?;
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            width: HeaderWidth::Two,
            min_msg_len: crate::config::DEFAULT_MIN_MSG_LEN,
            max_msg_len: crate::config::DEFAULT_MAX_MSG_LEN,
            byte_order: ByteOrder::BigEndian,
        }
    }
}
