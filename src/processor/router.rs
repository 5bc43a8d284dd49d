//! External routers: hand typed messages to another task.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::TypedMessage;

/// One routed message together with the context it arrived on.
#[derive(Debug, Clone)]
pub struct RoutedCall<C> {
    pub kind: &'static str,
    pub message: TypedMessage,
    pub ctx: C,
}

/// Asynchronous destination for routed messages.
///
/// `go` is called on the connection's read task and must not block.
pub trait AsyncRouter<C>: Send + Sync {
    fn go(&self, call: RoutedCall<C>);
}

/// Router backed by a bounded channel.
///
/// When the channel is full the call is dropped with a warning; the reading
/// connection is never stalled by a slow consumer.
#[derive(Debug)]
pub struct ChanRouter<C> {
    tx: mpsc::Sender<RoutedCall<C>>,
}

impl<C> ChanRouter<C> {
    /// Create a router and the receiver its calls arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RoutedCall<C>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl<C> Clone for ChanRouter<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: Send + 'static> AsyncRouter<C> for ChanRouter<C> {
    fn go(&self, call: RoutedCall<C>) {
        match self.tx.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                tracing::warn!(kind = call.kind, "router queue full, dropping message");
            }
            Err(TrySendError::Closed(call)) => {
                tracing::debug!(kind = call.kind, "router receiver gone, dropping message");
            }
        }
    }
}
