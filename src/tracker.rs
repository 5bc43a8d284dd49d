//! Connection identity and lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Keep the live-connection set of one server or client, bounded by a cap
//! - Count outstanding per-connection tasks so shutdown can wait for them

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::conn::TcpConn;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Default)]
struct ConnTable {
    conns: HashMap<ConnectionId, Arc<TcpConn>>,
    shut_down: bool,
}

/// Live connections of one server or client.
///
/// Every mutation happens under a single mutex, so the admission check and
/// the insert are atomic with respect to each other.
#[derive(Default)]
pub struct ConnSet {
    table: Mutex<ConnTable>,
}

impl ConnSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ConnTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `conn` unless the set already holds `cap` connections or has
    /// been shut down. On refusal the connection is handed back.
    pub fn try_insert(&self, conn: Arc<TcpConn>, cap: usize) -> Result<(), Arc<TcpConn>> {
        let mut table = self.lock();
        if table.shut_down || table.conns.len() >= cap {
            return Err(conn);
        }
        table.conns.insert(conn.id(), conn);
        Ok(())
    }

    /// Check whether a connection slot is free, without reserving it.
    pub fn has_room(&self, cap: usize) -> bool {
        let table = self.lock();
        !table.shut_down && table.conns.len() < cap
    }

    /// Remove a connection. Unknown IDs are ignored.
    pub fn remove(&self, id: ConnectionId) {
        self.lock().conns.remove(&id);
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().conns.is_empty()
    }

    /// Whether [`destroy_all`](Self::destroy_all) has run.
    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Destroy every live connection, clear the set and refuse any later
    /// insert.
    pub fn destroy_all(&self) {
        let mut table = self.lock();
        table.shut_down = true;
        for conn in table.conns.values() {
            conn.destroy();
        }
        table.conns.clear();
    }
}

/// Wait group for per-connection tasks.
///
/// `track()` hands out guards; `wait()` resolves once every guard has been
/// dropped.
#[derive(Debug, Clone)]
pub struct TaskTracker {
    count: Arc<watch::Sender<usize>>,
}

impl TaskTracker {
    /// Create a tracker with no tasks.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    /// Record a new task. The returned guard decrements on drop.
    pub fn track(&self) -> TaskGuard {
        self.count.send_modify(|n| *n += 1);
        TaskGuard {
            count: Arc::clone(&self.count),
        }
    }

    /// Number of tasks still running.
    pub fn active_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until every tracked task has finished.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a task's lifetime.
#[derive(Debug)]
pub struct TaskGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn connection_id_display() {
        let id = ConnectionId::new();
        assert_eq!(id.to_string(), format!("conn-{}", id.as_u64()));
    }

    #[test]
    fn task_tracker_counts() {
        let tracker = TaskTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn task_tracker_wait_returns_immediately_when_idle() {
        let tracker = TaskTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn task_tracker_wait_blocks_until_guards_drop() {
        let tracker = TaskTracker::new();
        let guard = tracker.track();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
