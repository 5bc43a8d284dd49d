//! Outbound drain loop for a single connection.
//!
//! Each [`TcpConn`](crate::conn::TcpConn) owns a bounded queue of encoded
//! frames and one task running [`writer_loop`], which is the only code that
//! writes to the socket.
//!
//! # Architecture
//!
//! ```text
//! write_msg 1 ─┐
//! write_msg 2 ─┼─► slot + mpsc::Sender<Queued> ─► writer_loop ─► socket
//! write_msg N ─┘     │ no slot?
//!                    └─► connection destroyed
//! ```
//!
//! Frames are batched: after the first frame arrives, every frame already
//! queued (up to [`MAX_BATCH_SIZE`]) goes out in one vectored write. FIFO
//! order is preserved.
//!
//! Each frame carries a [`QueueSlot`] permit. The slot is released only once
//! the frame has been written, so frames taken into a blocked batch still
//! count against the connection's queue capacity.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};

use crate::conn::{wait_until, ConnectionState};
use crate::error::{GateError, Result};

/// Maximum frames to batch in a single write operation.
pub const MAX_BATCH_SIZE: usize = 64;

/// Queue capacity held by one unwritten frame.
pub type QueueSlot = OwnedSemaphorePermit;

/// One encoded frame waiting for the socket.
#[derive(Debug)]
pub struct Queued {
    frame: Bytes,
    slot: QueueSlot,
}

impl Queued {
    pub fn new(frame: Bytes, slot: QueueSlot) -> Self {
        Self { frame, slot }
    }
}

/// Why the drain loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainExit {
    /// Queue closed and every queued frame written; write side shut down.
    Drained,
    /// Destroy observed; queued frames were dropped.
    Destroyed,
}

/// Drain `rx` into `writer` until the queue closes or the connection is
/// destroyed.
///
/// A write error ends the loop with `Err`; the caller treats that like a
/// close.
pub async fn writer_loop<W>(
    rx: &mut mpsc::Receiver<Queued>,
    writer: &mut W,
    state: &mut watch::Receiver<ConnectionState>,
) -> Result<DrainExit>
where
    W: AsyncWrite + Unpin,
{
    let mut batch: Vec<Bytes> = Vec::with_capacity(MAX_BATCH_SIZE);
    let mut slots: Vec<QueueSlot> = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = tokio::select! {
            biased;
            _ = wait_until(&mut *state, ConnectionState::is_destroyed) => {
                return Ok(DrainExit::Destroyed);
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        batch.clear();
        slots.clear();
        batch.push(first.frame);
        slots.push(first.slot);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(queued) => {
                    batch.push(queued.frame);
                    slots.push(queued.slot);
                }
                Err(_) => break,
            }
        }

        tokio::select! {
            biased;
            _ = wait_until(&mut *state, ConnectionState::is_destroyed) => {
                return Ok(DrainExit::Destroyed);
            }
            written = write_batch(writer, &batch) => written?,
        }
        slots.clear();
    }

    writer.shutdown().await?;
    Ok(DrainExit::Drained)
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
///
/// Partial writes are resumed from the first unwritten byte.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(GateError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after `skip_bytes` were written.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}
