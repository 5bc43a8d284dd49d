//! Per-connection worker capability.
//!
//! Both [`TcpServer`](crate::server::TcpServer) and
//! [`TcpClient`](crate::client::TcpClient) build one [`Agent`] per
//! connection through a factory and drive it with [`supervise`]:
//!
//! ```text
//! factory(conn) ─► agent.run() ─► conn.close() ─► remove from set ─► agent.on_close()
//! ```
//!
//! Close and removal also happen when `run` panics, so the connection's
//! admission slot is always released.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::conn::TcpConn;
use crate::tracker::ConnSet;

/// Boxed future returned by [`Agent::run`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-connection worker.
///
/// `run` usually loops on [`TcpConn::read_msg`] until it fails; returning
/// from `run` ends the connection.
pub trait Agent: Send + 'static {
    /// Serve the connection.
    fn run(&mut self) -> BoxFuture<'_, ()>;

    /// Called exactly once, after the connection has been closed and removed
    /// from its owner's set. Skipped if `run` panicked.
    fn on_close(&mut self);
}

/// Factory building an agent for each new connection.
pub type NewAgent = Arc<dyn Fn(Arc<TcpConn>) -> Box<dyn Agent> + Send + Sync>;

/// Drive one agent to completion and tear its connection down.
pub(crate) async fn supervise(conn: Arc<TcpConn>, mut agent: Box<dyn Agent>, conns: &ConnSet) {
    let teardown = Teardown { conn, conns };
    agent.run().await;
    drop(teardown);

    agent.on_close();
}

/// Closes the connection and frees its slot when dropped, including during
/// unwinding out of `Agent::run`.
struct Teardown<'a> {
    conn: Arc<TcpConn>,
    conns: &'a ConnSet,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.conn.close();
        self.conns.remove(self.conn.id());

        if std::thread::panicking() {
            tracing::error!(conn = %self.conn.id(), peer = %self.conn.remote_addr(), "agent panicked");
        } else {
            tracing::trace!(conn = %self.conn.id(), peer = %self.conn.remote_addr(), "agent finished");
        }
    }
}
