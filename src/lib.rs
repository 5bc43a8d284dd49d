//! # wiregate
//!
//! Length-prefixed TCP transport and JSON message routing for stateful
//! servers (game gates, session servers, server-to-server links).
//!
//! ## Architecture
//!
//! - **Transport**: [`TcpServer`] accepts up to `max_conn_num` sockets and
//!   runs one [`Agent`] per connection; [`TcpClient`] dials and does the
//!   same from the other side.
//! - **Connection**: [`TcpConn`] reads frames inline and queues outbound
//!   frames on a bounded channel drained by its own task. A peer that does
//!   not keep up is disconnected instead of stalling the writer.
//! - **Framing**: `[1|2|4-byte length][payload]`, see [`protocol`].
//! - **Messages**: `{"Kind": {...}}` JSON envelopes decoded and dispatched
//!   by [`processor::JsonProcessor`]; [`gate::Gate`] wires it to a server.
//!
//! ## Example
//!
//! ```ignore
//! use wiregate::gate::{Gate, Session};
//! use wiregate::processor::JsonProcessor;
//! use wiregate::ServerBuilder;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Hello {
//!     name: String,
//! }
//! wiregate::impl_message!(Hello);
//!
//! #[tokio::main]
//! async fn main() -> wiregate::Result<()> {
//!     let mut processor = JsonProcessor::<Session>::new();
//!     processor.register::<Hello>()?;
//!     processor.set_handler(|msg: &Hello, session: &Session| {
//!         let _ = session.write_msg(msg);
//!     })?;
//!
//!     let gate = Gate::new(processor);
//!     let server = ServerBuilder::new("127.0.0.1:3563")
//!         .new_agent(move |conn| gate.agent(conn))
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.close().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod gate;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod tracker;

mod writer;

pub use agent::Agent;
pub use client::{ClientBuilder, TcpClient};
pub use conn::{ConnectionState, TcpConn};
pub use error::{GateError, Result};
pub use server::{ServerBuilder, TcpServer};
