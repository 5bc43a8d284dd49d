//! TCP listener: admission, agent spawning and shutdown.
//!
//! # Architecture
//!
//! ```text
//!               ┌──────────────┐  over cap: drop stream
//! TcpListener ─►│ accept loop  │──────────────────────────► (closed)
//!               └──────┬───────┘
//!                      │ TcpConn::new + ConnSet::try_insert
//!                      ▼
//!              spawn supervise(agent)   ◄── TaskTracker guard
//! ```
//!
//! [`TcpServer::close`] is a full barrier: the accept loop is stopped and
//! awaited, every live connection is destroyed, then every agent task is
//! awaited (including its `on_close`).
//!
//! # Example
//!
//! ```ignore
//! use wiregate::server::ServerBuilder;
//!
//! let server = ServerBuilder::new("127.0.0.1:3563")
//!     .max_conn_num(1000)
//!     .new_agent(|conn| MyAgent::new(conn))
//!     .start()
//!     .await?;
//!
//! // ...
//! server.close().await;
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::agent::{supervise, Agent, NewAgent};
use crate::config::{FrameConfig, ServerConfig};
use crate::conn::TcpConn;
use crate::error::{GateError, Result};
use crate::protocol::FrameCodec;
use crate::tracker::{ConnSet, TaskTracker};

/// First retry delay after a transient accept error.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Retry delay ceiling.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Builder for a [`TcpServer`].
pub struct ServerBuilder {
    config: ServerConfig,
    new_agent: Option<NewAgent>,
}

impl ServerBuilder {
    /// Start from default settings, listening on `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::from_config(ServerConfig {
            addr: addr.into(),
            ..ServerConfig::default()
        })
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            config,
            new_agent: None,
        }
    }

    /// Maximum simultaneous connections. Default: 100
    pub fn max_conn_num(mut self, max_conn_num: usize) -> Self {
        self.config.max_conn_num = max_conn_num;
        self
    }

    /// Outbound queue capacity per connection. Default: 100
    pub fn pending_write_num(mut self, pending_write_num: usize) -> Self {
        self.config.pending_write_num = pending_write_num;
        self
    }

    /// Frame codec settings.
    pub fn frame(mut self, frame: FrameConfig) -> Self {
        self.config.frame = frame;
        self
    }

    /// Set the factory invoked once per admitted connection.
    pub fn new_agent<F, A>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<TcpConn>) -> A + Send + Sync + 'static,
        A: Agent,
    {
        self.new_agent = Some(Arc::new(move |conn| Box::new(factory(conn)) as Box<dyn Agent>));
        self
    }

    /// Bind the listener and start accepting.
    ///
    /// # Errors
    ///
    /// Returns `GateError::Config` if no agent factory was set or the frame
    /// settings are invalid, and `GateError::Io` if binding fails.
    pub async fn start(self) -> Result<TcpServer> {
        let mut config = self.config;
        config.normalize();

        let new_agent = self
            .new_agent
            .ok_or_else(|| GateError::Config("new_agent must be set".to_string()))?;
        let codec = FrameCodec::new(&config.frame)?;

        let listener = TcpListener::bind(&config.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            address = %local_addr,
            max_conn_num = config.max_conn_num,
            pending_write_num = config.pending_write_num,
            "server listening"
        );

        let shared = Arc::new(ServerShared {
            conns: ConnSet::new(),
            tracker: TaskTracker::new(),
            codec,
            max_conn_num: config.max_conn_num,
            pending_write_num: config.pending_write_num,
            new_agent,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown_rx));

        Ok(TcpServer {
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
            shared,
        })
    }
}

/// State shared between the server handle, the accept loop and agent tasks.
struct ServerShared {
    conns: ConnSet,
    tracker: TaskTracker,
    codec: FrameCodec,
    max_conn_num: usize,
    pending_write_num: usize,
    new_agent: NewAgent,
}

/// A running TCP server.
pub struct TcpServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<ServerShared>,
}

impl TcpServer {
    /// Create a new server builder.
    pub fn builder(addr: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(addr)
    }

    /// Address the listener is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn conn_count(&self) -> usize {
        self.shared.conns.len()
    }

    /// Stop accepting, destroy every connection and wait for every agent.
    ///
    /// Safe to call more than once; every call returns only after the
    /// shutdown is complete.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "accept loop panicked");
            }
        }

        self.shared.conns.destroy_all();
        self.shared.tracker.wait().await;
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .field("conn_count", &self.conn_count())
            .finish()
    }
}

/// Resolve once shutdown is requested or the sender is dropped.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = AcceptBackoff::default();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        let stream = match accepted {
            Ok((stream, _)) => {
                backoff.reset();
                stream
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                tracing::warn!(error = %e, retry_in = ?delay, "accept error, retrying");
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed, listener stopped");
                break;
            }
        };

        if !shared.conns.has_room(shared.max_conn_num) {
            drop(stream);
            tracing::debug!(max_conn_num = shared.max_conn_num, "too many connections");
            continue;
        }

        let conn = match TcpConn::new(stream, shared.pending_write_num, shared.codec) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(error = %e, "dropping accepted socket");
                continue;
            }
        };

        if let Err(conn) = shared.conns.try_insert(Arc::clone(&conn), shared.max_conn_num) {
            conn.destroy();
            continue;
        }
        tracing::debug!(conn = %conn.id(), peer = %conn.remote_addr(), "connection accepted");

        let agent = (shared.new_agent)(Arc::clone(&conn));
        let guard = shared.tracker.track();
        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _guard = guard;
            supervise(conn, agent, &task_shared.conns).await;
        });
    }

    tracing::debug!("accept loop stopped");
}

/// Exponential backoff for transient accept errors: 5ms doubling up to 1s,
/// reset after every successful accept.
#[derive(Debug, Default)]
struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = match self.delay {
            None => ACCEPT_BACKOFF_MIN,
            Some(prev) => (prev * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.delay = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.delay = None;
    }
}

/// Errors after which accepting may succeed again.
fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut | OutOfMemory
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        if let Some(code) = e.raw_os_error() {
            return matches!(code, libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM);
        }
    }

    false
}
