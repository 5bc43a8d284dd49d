//! Echo Gate - JSON echo server example.
//!
//! This example demonstrates:
//! - Registering message kinds on a `JsonProcessor`
//! - Replying through the connection's `Session`
//! - Graceful shutdown on Ctrl-C
//!
//! # Running
//!
//! ```text
//! RUST_LOG=wiregate=debug cargo run --example echo
//! ```
//!
//! Every frame is a 2-byte big-endian length followed by a JSON envelope,
//! e.g. `{"Hello":{"name":"leaf"}}`. The server answers `Hello` with the same
//! message and `Ping` with a `Pong` carrying the same sequence number.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use wiregate::gate::{Gate, Session};
use wiregate::processor::JsonProcessor;
use wiregate::ServerBuilder;

#[derive(Serialize, Deserialize, Debug)]
struct Hello {
    name: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct Ping {
    seq: u64,
}

#[derive(Serialize, Deserialize, Debug)]
struct Pong {
    seq: u64,
}

wiregate::impl_message!(Hello, Ping, Pong);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut processor = JsonProcessor::<Session>::new();
    processor.register::<Hello>()?;
    processor.register::<Ping>()?;
    processor.register::<Pong>()?;

    processor.set_handler(|msg: &Hello, session: &Session| {
        tracing::info!(peer = %session.remote_addr(), name = %msg.name, "hello");
        if let Err(e) = session.write_msg(msg) {
            tracing::warn!(error = %e, "reply failed");
        }
    })?;
    processor.set_handler(|msg: &Ping, session: &Session| {
        if let Err(e) = session.write_msg(&Pong { seq: msg.seq }) {
            tracing::warn!(error = %e, "reply failed");
        }
    })?;

    let gate = Gate::new(processor)
        .on_open(|session| tracing::info!(peer = %session.remote_addr(), "agent opened"))
        .on_close(|session| tracing::info!(peer = %session.remote_addr(), "agent closed"));

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:3563".to_string());
    let server = ServerBuilder::new(addr)
        .max_conn_num(1000)
        .new_agent(move |conn| gate.agent(conn))
        .start()
        .await?;

    tracing::info!(address = %server.local_addr(), "echo gate ready, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    server.close().await;
    tracing::info!("echo gate stopped");
    Ok(())
}
