//! Ready-made message agent.
//!
//! [`Gate`] turns a frozen [`JsonProcessor`] into an agent factory: each
//! connection reads frames, decodes them and routes them with its
//! [`Session`] as context, until the first error.
//!
//! # Example
//!
//! ```ignore
//! let mut processor = JsonProcessor::<Session>::new();
//! processor.register::<Hello>()?;
//! processor.set_handler(|msg: &Hello, session: &Session| {
//!     let _ = session.write_msg(msg);
//! })?;
//!
//! let gate = Gate::new(processor);
//! let server = ServerBuilder::new("127.0.0.1:3563")
//!     .new_agent(move |conn| gate.agent(conn))
//!     .start()
//!     .await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use crate::agent::{Agent, BoxFuture};
use crate::conn::TcpConn;
use crate::error::Result;
use crate::processor::{JsonProcessor, Message};
use crate::tracker::ConnectionId;

type SessionHook = Arc<dyn Fn(&Session) + Send + Sync>;

/// Per-connection context passed to message handlers and routers.
///
/// Cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct Session {
    conn: Arc<TcpConn>,
    processor: Arc<JsonProcessor<Session>>,
}

impl Session {
    /// Marshal `msg` and queue it as one frame.
    pub fn write_msg<M: Message>(&self, msg: &M) -> Result<()> {
        let data = self.processor.marshal(msg)?;
        self.conn.write_msg(&[&data])
    }

    /// Close after the queued frames are written.
    pub fn close(&self) {
        self.conn.close();
    }

    /// Drop the connection immediately.
    pub fn destroy(&self) {
        self.conn.destroy();
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// Underlying connection.
    #[inline]
    pub fn conn(&self) -> &Arc<TcpConn> {
        &self.conn
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.conn.id())
            .field("remote_addr", &self.conn.remote_addr())
            .finish()
    }
}

/// Agent factory for JSON message connections.
#[derive(Clone)]
pub struct Gate {
    processor: Arc<JsonProcessor<Session>>,
    on_open: Option<SessionHook>,
    on_close: Option<SessionHook>,
}

impl Gate {
    /// Freeze `processor` and build a gate around it.
    pub fn new(processor: JsonProcessor<Session>) -> Self {
        Self {
            processor: Arc::new(processor),
            on_open: None,
            on_close: None,
        }
    }

    /// Called when a connection's agent is created, before any read.
    pub fn on_open<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Called once the connection is closed and removed from its owner.
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// The shared processor.
    pub fn processor(&self) -> &Arc<JsonProcessor<Session>> {
        &self.processor
    }

    /// Build the agent for one connection.
    pub fn agent(&self, conn: Arc<TcpConn>) -> GateAgent {
        let session = Session {
            conn,
            processor: Arc::clone(&self.processor),
        };
        if let Some(hook) = &self.on_open {
            hook(&session);
        }

        GateAgent {
            session,
            on_close: self.on_close.clone(),
        }
    }
}

/// Agent built by [`Gate::agent`].
pub struct GateAgent {
    session: Session,
    on_close: Option<SessionHook>,
}

impl GateAgent {
    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn serve(&self) {
        let session = &self.session;
        loop {
            let data = match session.conn.read_msg().await {
                Ok(data) => data,
                Err(e) => {
                    tracing::debug!(conn = %session.id(), error = %e, "read message");
                    return;
                }
            };

            let msg = match session.processor.unmarshal(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(conn = %session.id(), error = %e, "unmarshal message");
                    return;
                }
            };

            if let Err(e) = session.processor.route(msg, session) {
                tracing::debug!(conn = %session.id(), error = %e, "route message");
                return;
            }
        }
    }
}

impl Agent for GateAgent {
    fn run(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.serve())
    }

    fn on_close(&mut self) {
        if let Some(hook) = &self.on_close {
            hook(&self.session);
        }
    }
}
