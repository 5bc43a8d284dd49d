//! Client builder and dial loop.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the dialer.
//! The [`TcpClient`] keeps `conn_num` connections to one address, each
//! driven by its own task:
//! 1. Dial, retrying every `connect_interval`
//! 2. Wrap the socket in a [`TcpConn`] and build an agent
//! 3. Run the agent; on return close the connection and call `on_close`
//! 4. With `auto_reconnect`, wait `connect_interval` and go back to 1
//!
//! # Example
//!
//! ```ignore
//! use wiregate::client::ClientBuilder;
//!
//! let client = ClientBuilder::new("127.0.0.1:3563")
//!     .conn_num(4)
//!     .auto_reconnect(true)
//!     .new_agent(|conn| Upstream::new(conn))
//!     .start()?;
//!
//! // ...
//! client.close().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::agent::{supervise, Agent, NewAgent};
use crate::config::{ClientConfig, FrameConfig};
use crate::conn::TcpConn;
use crate::error::{GateError, Result};
use crate::protocol::FrameCodec;
use crate::server::shutdown_requested;
use crate::tracker::{ConnSet, TaskTracker};

/// Builder for a [`TcpClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    new_agent: Option<NewAgent>,
}

impl ClientBuilder {
    /// Start from default settings, dialing `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::from_config(ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        })
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            new_agent: None,
        }
    }

    /// Number of parallel connections. Default: 1
    pub fn conn_num(mut self, conn_num: usize) -> Self {
        self.config.conn_num = conn_num;
        self
    }

    /// Delay between dial attempts. Default: 3 seconds
    pub fn connect_interval(mut self, interval: Duration) -> Self {
        self.config.connect_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Outbound queue capacity per connection. Default: 100
    pub fn pending_write_num(mut self, pending_write_num: usize) -> Self {
        self.config.pending_write_num = pending_write_num;
        self
    }

    /// Re-dial after a connection ends. Default: false
    pub fn auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.config.auto_reconnect = auto_reconnect;
        self
    }

    /// Frame codec settings.
    pub fn frame(mut self, frame: FrameConfig) -> Self {
        self.config.frame = frame;
        self
    }

    /// Set the factory invoked once per established connection.
    pub fn new_agent<F, A>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<TcpConn>) -> A + Send + Sync + 'static,
        A: Agent,
    {
        self.new_agent = Some(Arc::new(move |conn| Box::new(factory(conn)) as Box<dyn Agent>));
        self
    }

    /// Spawn the dial tasks. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `GateError::Config` if no agent factory was set or the frame
    /// settings are invalid.
    pub fn start(self) -> Result<TcpClient> {
        let mut config = self.config;
        config.normalize();

        let new_agent = self
            .new_agent
            .ok_or_else(|| GateError::Config("new_agent must be set".to_string()))?;
        let codec = FrameCodec::new(&config.frame)?;
        let connect_interval = config.connect_interval();
        let conn_num = config.conn_num;

        let shared = Arc::new(ClientShared {
            conns: ConnSet::new(),
            tracker: TaskTracker::new(),
            codec,
            addr: config.addr,
            connect_interval,
            pending_write_num: config.pending_write_num,
            auto_reconnect: config.auto_reconnect,
            new_agent,
        });

        let (shutdown, _) = watch::channel(false);
        for _ in 0..conn_num {
            let guard = shared.tracker.track();
            let task_shared = Arc::clone(&shared);
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                let _guard = guard;
                connect_loop(task_shared, shutdown_rx).await;
            });
        }

        Ok(TcpClient { shutdown, shared })
    }
}

struct ClientShared {
    conns: ConnSet,
    tracker: TaskTracker,
    codec: FrameCodec,
    addr: String,
    connect_interval: Duration,
    pending_write_num: usize,
    auto_reconnect: bool,
    new_agent: NewAgent,
}

/// A running dialer.
pub struct TcpClient {
    shutdown: watch::Sender<bool>,
    shared: Arc<ClientShared>,
}

impl TcpClient {
    /// Create a new client builder.
    pub fn builder(addr: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(addr)
    }

    /// Number of established connections.
    pub fn conn_count(&self) -> usize {
        self.shared.conns.len()
    }

    /// Stop dialing, destroy every connection and wait for every task.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.shared.conns.destroy_all();
        self.shared.tracker.wait().await;
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("addr", &self.shared.addr)
            .field("conn_count", &self.conn_count())
            .finish()
    }
}

async fn connect_loop(shared: Arc<ClientShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some(stream) = dial(&shared, &mut shutdown).await else {
            return;
        };

        let conn = match TcpConn::new(stream, shared.pending_write_num, shared.codec) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(addr = %shared.addr, error = %e, "dropping dialed socket");
                if !pause(shared.connect_interval, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        if let Err(conn) = shared.conns.try_insert(Arc::clone(&conn), usize::MAX) {
            // Closed while dialing.
            conn.destroy();
            return;
        }
        tracing::debug!(conn = %conn.id(), addr = %shared.addr, "connected");

        let agent = (shared.new_agent)(Arc::clone(&conn));
        supervise(conn, agent, &shared.conns).await;

        if !shared.auto_reconnect || !pause(shared.connect_interval, &mut shutdown).await {
            return;
        }
    }
}

/// Dial until connected. `None` once shutdown is requested.
async fn dial(shared: &ClientShared, shutdown: &mut watch::Receiver<bool>) -> Option<TcpStream> {
    loop {
        let connected = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => return None,
            connected = TcpStream::connect(&shared.addr) => connected,
        };

        match connected {
            Ok(stream) => return Some(stream),
            Err(e) => tracing::debug!(
                addr = %shared.addr,
                error = %e,
                retry_in = ?shared.connect_interval,
                "connect failed"
            ),
        }

        if !pause(shared.connect_interval, shutdown).await {
            return None;
        }
    }
}

/// Sleep for `delay`. Returns false if shutdown was requested first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
