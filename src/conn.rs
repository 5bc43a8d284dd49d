//! Framed TCP connection with a bounded outbound queue.
//!
//! A [`TcpConn`] wraps one accepted (or dialed) socket:
//! - Reads are pass-through: [`read`](TcpConn::read) for raw bytes,
//!   [`read_msg`](TcpConn::read_msg) for one frame via the shared
//!   [`FrameCodec`]. A single owner is expected to read.
//! - Writes never block: [`write`](TcpConn::write) and
//!   [`write_msg`](TcpConn::write_msg) push one buffer onto a bounded queue
//!   drained by a dedicated task (see [`crate::writer`]). If the queue is full
//!   the peer is not keeping up and the connection is destroyed.
//!
//! # States
//!
//! ```text
//! Active ──close()──► Draining ──queue drained──► Closed
//!    │                    │
//!    └──destroy()─────────┴──────────────────────► Destroyed
//! ```
//!
//! `close()` lets the drain task flush what is already queued; `destroy()`
//! drops queued data, sets `SO_LINGER=0` and releases the socket at once.
//! Both are idempotent and may be called from any task.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::error::{GateError, Result};
use crate::protocol::FrameCodec;
use crate::tracker::ConnectionId;
use crate::writer::{writer_loop, DrainExit, Queued};

/// Smallest outbound queue a connection will run with.
pub const MIN_PENDING_WRITE_NUM: usize = 1;

/// Connection state, published to the reader and the drain task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading and writing.
    Active,
    /// Close requested; queued frames are still being written.
    Draining,
    /// Queue drained (or a write failed) and the socket shut down.
    Closed,
    /// Forcibly torn down; queued frames were discarded.
    Destroyed,
}

impl ConnectionState {
    /// Socket is gone; no more reads.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Destroyed)
    }

    #[inline]
    pub fn is_destroyed(self) -> bool {
        self == ConnectionState::Destroyed
    }
}

/// Resolve once the published state satisfies `pred`, or once the sender is
/// gone.
pub(crate) async fn wait_until<F>(rx: &mut watch::Receiver<ConnectionState>, pred: F)
where
    F: Fn(ConnectionState) -> bool,
{
    loop {
        if pred(*rx.borrow_and_update()) {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Outbound queue and closed flag. Guarded by one mutex so that the order of
/// enqueued frames is the order in which writers took the lock.
struct Outbound {
    tx: Option<mpsc::Sender<Queued>>,
    closed: bool,
}

/// A framed TCP connection.
///
/// Always handled as `Arc<TcpConn>`; it is shared between the agent, the
/// server's connection set, and anyone replying on it.
pub struct TcpConn {
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    codec: FrameCodec,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    outbound: Mutex<Outbound>,
    /// One permit per unwritten frame, queued or in the drain task's hands.
    slots: Arc<Semaphore>,
    capacity: usize,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl TcpConn {
    /// Wrap `stream` and spawn its drain task.
    ///
    /// `pending_write_num` is the most frames that may be accepted but not
    /// yet written, counting the batch the drain task is writing. It never
    /// changes afterwards. Server and client configs are normalized before
    /// they get here; a direct caller passing less than
    /// [`MIN_PENDING_WRITE_NUM`] gets that minimum. Must be called from
    /// within a tokio runtime.
    pub fn new(stream: TcpStream, pending_write_num: usize, codec: FrameCodec) -> Result<Arc<Self>> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let capacity = pending_write_num.max(MIN_PENDING_WRITE_NUM);
        let (tx, rx) = mpsc::channel(capacity);
        let (state, _) = watch::channel(ConnectionState::Active);
        let state = Arc::new(state);

        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            local_addr,
            peer_addr,
            codec,
            reader: tokio::sync::Mutex::new(Some(read_half)),
            outbound: Mutex::new(Outbound {
                tx: Some(tx),
                closed: false,
            }),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            state: Arc::clone(&state),
        });

        tokio::spawn(drain(Arc::downgrade(&conn), conn.id, rx, write_half, state));

        Ok(conn)
    }

    fn lock_outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unique ID of this connection.
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Local socket address.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer socket address.
    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Codec used by `read_msg` / `write_msg`.
    #[inline]
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether writes are still accepted.
    pub fn is_closed(&self) -> bool {
        self.lock_outbound().closed
    }

    /// Outbound queue capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of accepted frames not yet written to the socket. Zero once
    /// the connection is closed.
    pub fn pending_writes(&self) -> usize {
        let out = self.lock_outbound();
        if out.tx.is_none() {
            return 0;
        }
        self.capacity - self.slots.available_permits()
    }

    /// Queue one fully formed buffer for the socket.
    ///
    /// Never blocks. A no-op once the connection is closed. If
    /// [`capacity`](TcpConn::capacity) frames are already waiting for the
    /// socket the connection is destroyed instead.
    pub fn write(&self, frame: Bytes) {
        let mut out = self.lock_outbound();
        if out.closed {
            return;
        }
        let Some(tx) = out.tx.as_ref() else {
            return;
        };

        let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
            tracing::debug!(conn = %self.id, peer = %self.peer_addr, "close conn: channel full");
            self.destroy_locked(&mut out);
            return;
        };

        match tx.try_send(Queued::new(frame, slot)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(conn = %self.id, peer = %self.peer_addr, "close conn: channel full");
                self.destroy_locked(&mut out);
            }
            Err(TrySendError::Closed(_)) => {
                out.closed = true;
                out.tx = None;
            }
        }
    }

    /// Encode `segments` as one frame and queue it.
    ///
    /// # Errors
    ///
    /// Returns a framing error if the total length is out of bounds. A
    /// closed connection is not an error; the frame is dropped.
    pub fn write_msg(&self, segments: &[&[u8]]) -> Result<()> {
        let frame = self.codec.encode(segments)?;
        self.write(frame);
        Ok(())
    }

    /// Read raw bytes from the socket.
    ///
    /// Returns `Ok(0)` at end of stream and `ConnectionClosed` once the
    /// connection has been closed or destroyed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        let Some(half) = reader.as_mut() else {
            return Err(GateError::ConnectionClosed);
        };

        let mut state = self.state.subscribe();
        let result = tokio::select! {
            biased;
            _ = wait_until(&mut state, ConnectionState::is_terminal) => Err(GateError::ConnectionClosed),
            n = half.read(buf) => n.map_err(GateError::from),
        };

        if matches!(result, Err(GateError::ConnectionClosed)) {
            reader.take();
        }
        result
    }

    /// Read one frame and return its payload.
    pub async fn read_msg(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let Some(half) = reader.as_mut() else {
            return Err(GateError::ConnectionClosed);
        };

        let mut state = self.state.subscribe();
        let result = tokio::select! {
            biased;
            _ = wait_until(&mut state, ConnectionState::is_terminal) => Err(GateError::ConnectionClosed),
            frame = self.codec.read(half) => frame,
        };

        if matches!(result, Err(GateError::ConnectionClosed)) {
            reader.take();
        }
        result
    }

    /// Close gracefully: stop accepting writes, flush what is queued, then
    /// shut the socket down.
    pub fn close(&self) {
        let mut out = self.lock_outbound();
        if out.closed {
            return;
        }
        out.closed = true;
        // Dropping the sender is the end-of-stream marker for the drain task.
        out.tx = None;

        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Active {
                *state = ConnectionState::Draining;
                true
            } else {
                false
            }
        });
    }

    /// Tear down immediately, discarding anything still queued.
    pub fn destroy(&self) {
        let mut out = self.lock_outbound();
        self.destroy_locked(&mut out);
    }

    fn destroy_locked(&self, out: &mut Outbound) {
        out.closed = true;
        out.tx = None;

        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ConnectionState::Destroyed;
                true
            }
        });

        // An idle read half is released here; a busy one by its reader.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }
}

impl std::fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConn")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Drain task body: owns the write half for the connection's lifetime.
async fn drain(
    conn: Weak<TcpConn>,
    id: ConnectionId,
    mut rx: mpsc::Receiver<Queued>,
    mut writer: OwnedWriteHalf,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut signal = state.subscribe();

    match writer_loop(&mut rx, &mut writer, &mut signal).await {
        Ok(DrainExit::Drained) => tracing::trace!(conn = %id, "outbound queue drained"),
        Ok(DrainExit::Destroyed) => {
            set_zero_linger(&writer);
            tracing::trace!(conn = %id, "connection destroyed");
        }
        Err(e) => tracing::debug!(conn = %id, error = %e, "write failed, closing connection"),
    }
    drop(writer);

    if let Some(conn) = conn.upgrade() {
        let mut out = conn.lock_outbound();
        out.closed = true;
        out.tx = None;
    }

    state.send_if_modified(|state| {
        if state.is_terminal() {
            false
        } else {
            *state = ConnectionState::Closed;
            true
        }
    });
}

#[allow(deprecated)]
fn set_zero_linger(writer: &OwnedWriteHalf) {
    let stream: &TcpStream = writer.as_ref();
    if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
        tracing::trace!(error = %e, "failed to set SO_LINGER");
    }
}
