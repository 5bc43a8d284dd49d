//! Configuration for servers, clients and the frame codec.
//!
//! Every struct derives serde traits with `#[serde(default)]`, so a host can
//! load a partial config from any serde format and get the defaults for the
//! rest. Zero-valued caps are not rejected: [`ServerConfig::normalize`] and
//! [`ClientConfig::normalize`] reset them to their defaults with a warning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default maximum number of live connections per server.
pub const DEFAULT_MAX_CONN_NUM: usize = 100;

/// Default outbound queue capacity per connection.
pub const DEFAULT_PENDING_WRITE_NUM: usize = 100;

/// Default length header width in bytes.
pub const DEFAULT_LEN_MSG_LEN: usize = 2;

/// Default minimum payload length.
pub const DEFAULT_MIN_MSG_LEN: u32 = 1;

/// Default maximum payload length.
pub const DEFAULT_MAX_MSG_LEN: u32 = 4096;

/// Default number of connections a client dials.
pub const DEFAULT_CONN_NUM: usize = 1;

/// Default delay between client dial attempts.
pub const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Length-prefix framing parameters shared by every connection of a server
/// or client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Header width in bytes: 1, 2 or 4.
    pub len_msg_len: usize,
    /// Smallest accepted payload length.
    pub min_msg_len: u32,
    /// Largest accepted payload length.
    pub max_msg_len: u32,
    /// Encode the header little endian instead of big endian.
    pub little_endian: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            len_msg_len: DEFAULT_LEN_MSG_LEN,
            min_msg_len: DEFAULT_MIN_MSG_LEN,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            little_endian: false,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g. "0.0.0.0:3563").
    pub addr: String,
    /// Maximum concurrent connections.
    pub max_conn_num: usize,
    /// Outbound queue capacity per connection.
    pub pending_write_num: usize,
    /// Framing parameters.
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3563".to_string(),
            max_conn_num: DEFAULT_MAX_CONN_NUM,
            pending_write_num: DEFAULT_PENDING_WRITE_NUM,
            frame: FrameConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Replace invalid caps with their defaults.
    pub fn normalize(&mut self) {
        if self.max_conn_num == 0 {
            self.max_conn_num = DEFAULT_MAX_CONN_NUM;
            tracing::warn!(max_conn_num = self.max_conn_num, "invalid max_conn_num, reset to default");
        }
        if self.pending_write_num == 0 {
            self.pending_write_num = DEFAULT_PENDING_WRITE_NUM;
            tracing::warn!(
                pending_write_num = self.pending_write_num,
                "invalid pending_write_num, reset to default"
            );
        }
    }
}

/// Dialer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote address to dial.
    pub addr: String,
    /// Number of parallel connections to keep.
    pub conn_num: usize,
    /// Delay between dial attempts, in milliseconds.
    pub connect_interval_ms: u64,
    /// Outbound queue capacity per connection.
    pub pending_write_num: usize,
    /// Re-dial after a connection's agent finishes.
    pub auto_reconnect: bool,
    /// Framing parameters.
    pub frame: FrameConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3563".to_string(),
            conn_num: DEFAULT_CONN_NUM,
            connect_interval_ms: DEFAULT_CONNECT_INTERVAL.as_millis() as u64,
            pending_write_num: DEFAULT_PENDING_WRITE_NUM,
            auto_reconnect: false,
            frame: FrameConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Delay between dial attempts.
    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    /// Replace invalid values with their defaults.
    pub fn normalize(&mut self) {
        if self.conn_num == 0 {
            self.conn_num = DEFAULT_CONN_NUM;
            tracing::warn!(conn_num = self.conn_num, "invalid conn_num, reset to default");
        }
        if self.connect_interval_ms == 0 {
            self.connect_interval_ms = DEFAULT_CONNECT_INTERVAL.as_millis() as u64;
            tracing::warn!(
                connect_interval_ms = self.connect_interval_ms,
                "invalid connect_interval, reset to default"
            );
        }
        if self.pending_write_num == 0 {
            self.pending_write_num = DEFAULT_PENDING_WRITE_NUM;
            tracing::warn!(
                pending_write_num = self.pending_write_num,
                "invalid pending_write_num, reset to default"
            );
        }
    }
}
