//! Integration tests for the TCP transport.
//!
//! These run real loopback servers and clients.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use wiregate::agent::BoxFuture;
use wiregate::protocol::FrameCodec;
use wiregate::{Agent, ClientBuilder, ConnectionState, GateError, ServerBuilder, TcpConn};

#[derive(Default)]
struct Counters {
    started: AtomicUsize,
    closed: AtomicUsize,
}

/// Reads until the connection fails; counts lifecycle events.
struct Reader {
    conn: Arc<TcpConn>,
    counters: Arc<Counters>,
}

impl Agent for Reader {
    fn run(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            while self.conn.read_msg().await.is_ok() {}
        })
    }

    fn on_close(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Echoes every frame back to the peer.
struct Echo {
    conn: Arc<TcpConn>,
}

impl Agent for Echo {
    fn run(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            while let Ok(payload) = self.conn.read_msg().await {
                if self.conn.write_msg(&[&payload]).is_err() {
                    break;
                }
            }
        })
    }

    fn on_close(&mut self) {}
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Read until EOF or reset; returns the bytes seen.
async fn drain_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return received,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
            Err(_) => panic!("peer never closed"),
        }
    }
}

#[tokio::test]
async fn test_admission_cap() {
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let server = ServerBuilder::new("127.0.0.1:0")
        .max_conn_num(2)
        .new_agent(move |conn| Reader {
            conn,
            counters: Arc::clone(&factory_counters),
        })
        .start()
        .await
        .unwrap();
    let addr = server.local_addr();

    let _first = TcpStream::connect(addr).await.unwrap();
    let _second = TcpStream::connect(addr).await.unwrap();
    eventually("two admitted connections", || server.conn_count() == 2).await;

    let mut third = TcpStream::connect(addr).await.unwrap();
    assert!(drain_to_end(&mut third).await.is_empty());

    assert_eq!(server.conn_count(), 2);
    eventually("two agents running", || counters.started.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(counters.started.load(Ordering::SeqCst), 2);

    server.close().await;
}

#[tokio::test]
async fn test_slot_freed_after_disconnect() {
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let server = ServerBuilder::new("127.0.0.1:0")
        .max_conn_num(1)
        .new_agent(move |conn| Reader {
            conn,
            counters: Arc::clone(&factory_counters),
        })
        .start()
        .await
        .unwrap();
    let addr = server.local_addr();

    let first = TcpStream::connect(addr).await.unwrap();
    eventually("first admitted", || server.conn_count() == 1).await;

    drop(first);
    eventually("first removed", || counters.closed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.conn_count(), 0);

    let _second = TcpStream::connect(addr).await.unwrap();
    eventually("second admitted", || server.conn_count() == 1).await;
    eventually("second agent running", || counters.started.load(Ordering::SeqCst) == 2).await;

    server.close().await;
}

/// Panics as soon as it starts serving.
struct Panicker {
    counters: Arc<Counters>,
}

impl Agent for Panicker {
    fn run(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            panic!("agent failed");
        })
    }

    fn on_close(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_panicking_agent_releases_slot() {
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let server = ServerBuilder::new("127.0.0.1:0")
        .max_conn_num(1)
        .new_agent(move |_| Panicker {
            counters: Arc::clone(&factory_counters),
        })
        .start()
        .await
        .unwrap();
    let addr = server.local_addr();

    let mut first = TcpStream::connect(addr).await.unwrap();
    eventually("first agent ran", || counters.started.load(Ordering::SeqCst) == 1).await;
    assert!(drain_to_end(&mut first).await.is_empty());
    eventually("first removed", || server.conn_count() == 0).await;

    // The only slot is free again.
    let mut second = TcpStream::connect(addr).await.unwrap();
    eventually("second agent ran", || counters.started.load(Ordering::SeqCst) == 2).await;
    assert!(drain_to_end(&mut second).await.is_empty());

    tokio::time::timeout(Duration::from_secs(2), server.close())
        .await
        .unwrap();
    assert_eq!(server.conn_count(), 0);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_close_is_full_barrier() {
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let server = ServerBuilder::new("127.0.0.1:0")
        .new_agent(move |conn| Reader {
            conn,
            counters: Arc::clone(&factory_counters),
        })
        .start()
        .await
        .unwrap();
    let addr = server.local_addr();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    eventually("all admitted", || server.conn_count() == 3).await;

    tokio::time::timeout(Duration::from_secs(2), server.close())
        .await
        .unwrap();

    // Every agent has returned and been notified by the time close returns.
    assert_eq!(counters.started.load(Ordering::SeqCst), 3);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 3);
    assert_eq!(server.conn_count(), 0);

    for client in &mut clients {
        drain_to_end(client).await;
    }
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_concurrent_close_calls() {
    let server = Arc::new(
        ServerBuilder::new("127.0.0.1:0")
            .new_agent(|conn| Echo { conn })
            .start()
            .await
            .unwrap(),
    );
    let _client = TcpStream::connect(server.local_addr()).await.unwrap();
    eventually("admitted", || server.conn_count() == 1).await;

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.close().await })
        })
        .collect();

    for closer in closers {
        tokio::time::timeout(Duration::from_secs(2), closer)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(server.conn_count(), 0);
}

#[tokio::test]
async fn test_echo_over_frames() {
    let server = ServerBuilder::new("127.0.0.1:0")
        .new_agent(|conn| Echo { conn })
        .start()
        .await
        .unwrap();
    let codec = FrameCodec::default();
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    codec.write(&mut client, &[b"hello ", b"gate"]).await.unwrap();
    codec.write(&mut client, &[b"second"]).await.unwrap();

    assert_eq!(&codec.read(&mut client).await.unwrap()[..], b"hello gate");
    assert_eq!(&codec.read(&mut client).await.unwrap()[..], b"second");

    server.close().await;
}

#[tokio::test]
async fn test_oversized_frame_ends_connection() {
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let server = ServerBuilder::new("127.0.0.1:0")
        .frame(wiregate::config::FrameConfig {
            max_msg_len: 16,
            ..Default::default()
        })
        .new_agent(move |conn| Reader {
            conn,
            counters: Arc::clone(&factory_counters),
        })
        .start()
        .await
        .unwrap();
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    // Header declares 1000 bytes.
    tokio::io::AsyncWriteExt::write_all(&mut client, &[0x03, 0xE8])
        .await
        .unwrap();

    drain_to_end(&mut client).await;
    eventually("agent closed", || counters.closed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.conn_count(), 0);

    server.close().await;
}

/// Floods its own queue without yielding, then reports what it saw.
struct Flood {
    conn: Arc<TcpConn>,
    pending_write_num: usize,
    report: mpsc::UnboundedSender<(ConnectionState, bool, bool)>,
}

impl Agent for Flood {
    fn run(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Nothing in this loop awaits, so on a current-thread runtime the
            // drain task cannot empty the queue in between.
            for _ in 0..=self.pending_write_num {
                self.conn.write(Bytes::from_static(b"flood"));
            }
            let state = self.conn.state();
            let closed = self.conn.is_closed();

            // Writes after the disconnect are silent no-ops.
            self.conn.write(Bytes::from_static(b"late"));
            let read_failed = matches!(self.conn.read_msg().await, Err(GateError::ConnectionClosed));

            let _ = self.report.send((state, closed, read_failed));
        })
    }

    fn on_close(&mut self) {}
}

#[tokio::test]
async fn test_full_queue_disconnects_peer() {
    let (report, mut reports) = mpsc::unbounded_channel();
    let server = ServerBuilder::new("127.0.0.1:0")
        .pending_write_num(4)
        .new_agent(move |conn| Flood {
            conn,
            pending_write_num: 4,
            report: report.clone(),
        })
        .start()
        .await
        .unwrap();
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    let (state, closed, read_failed) = tokio::time::timeout(Duration::from_secs(2), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, ConnectionState::Destroyed);
    assert!(closed);
    assert!(read_failed);

    // Queued frames were discarded, not flushed.
    assert!(drain_to_end(&mut client).await.is_empty());

    server.close().await;
}

/// Client-side agent: sends one frame, forwards the reply, then ends.
struct OneShot {
    conn: Arc<TcpConn>,
    replies: mpsc::UnboundedSender<Bytes>,
    counters: Arc<Counters>,
}

impl Agent for OneShot {
    fn run(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            if self.conn.write_msg(&[b"ping"]).is_err() {
                return;
            }
            if let Ok(reply) = self.conn.read_msg().await {
                let _ = self.replies.send(reply);
            }
        })
    }

    fn on_close(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_client_round_trip() {
    let server = ServerBuilder::new("127.0.0.1:0")
        .new_agent(|conn| Echo { conn })
        .start()
        .await
        .unwrap();

    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let client = ClientBuilder::new(server.local_addr().to_string())
        .conn_num(2)
        .new_agent(move |conn| OneShot {
            conn,
            replies: replies_tx.clone(),
            counters: Arc::clone(&factory_counters),
        })
        .start()
        .unwrap();

    for _ in 0..2 {
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], b"ping");
    }

    eventually("client agents closed", || counters.closed.load(Ordering::SeqCst) == 2).await;
    assert_eq!(client.conn_count(), 0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_client_auto_reconnect() {
    let server = ServerBuilder::new("127.0.0.1:0")
        .new_agent(|conn| Echo { conn })
        .start()
        .await
        .unwrap();

    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let client = ClientBuilder::new(server.local_addr().to_string())
        .auto_reconnect(true)
        .connect_interval(Duration::from_millis(10))
        .new_agent(move |conn| OneShot {
            conn,
            replies: replies_tx.clone(),
            counters: Arc::clone(&factory_counters),
        })
        .start()
        .unwrap();

    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
    }
    assert!(counters.started.load(Ordering::SeqCst) >= 3);

    tokio::time::timeout(Duration::from_secs(2), client.close())
        .await
        .unwrap();
    let started = counters.started.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.started.load(Ordering::SeqCst), started);

    server.close().await;
}

#[tokio::test]
async fn test_client_waits_for_server() {
    // Reserve a port, release it, and start the server there later.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    let client = ClientBuilder::new(addr.to_string())
        .connect_interval(Duration::from_millis(10))
        .new_agent(move |conn| OneShot {
            conn,
            replies: replies_tx.clone(),
            counters: Arc::new(Counters::default()),
        })
        .start()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let server = ServerBuilder::new(addr.to_string())
        .new_agent(|conn| Echo { conn })
        .start()
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[..], b"ping");

    client.close().await;
    server.close().await;
}
