//! Replay-last broadcast signals
//!
//! Lifecycle events (connected, disconnected, error, message) are broadcast
//! to possibly-many subscribers, and a late subscriber must immediately
//! observe the most recent emission of that signal. A plain broadcast channel
//! drops history, so `Signal` pairs one with a stored last value: `subscribe`
//! snapshots the latest emission and the receiver yields it before any live
//! values.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Default capacity for the underlying broadcast channel
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// A broadcast signal that replays its most recent value to new subscribers
#[derive(Clone)]
pub struct Signal<T> {
    last: Arc<Mutex<Option<T>>>,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Signal<T> {
    /// Create a signal with the default channel capacity
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            last: Arc::new(Mutex::new(None)),
            tx,
        }
    }

    /// Emit a value to all current subscribers and store it for late ones
    ///
    /// Emitting with no subscribers is not an error; the value is still
    /// stored for replay.
    pub fn emit(&self, value: T) {
        let mut last = self.last.lock();
        *last = Some(value.clone());
        let _ = self.tx.send(value);
    }

    /// Subscribe to the signal
    ///
    /// The returned receiver first yields the most recent emission (if one
    /// exists), then live values as they are emitted.
    pub fn subscribe(&self) -> SignalReceiver<T> {
        // Hold the lock across subscribe so an emit cannot land both in the
        // replay slot and in the fresh receiver.
        let last = self.last.lock();
        let rx = self.tx.subscribe();
        SignalReceiver {
            replay: last.clone(),
            rx,
        }
    }
}

impl<T: Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a [`Signal`] subscription
pub struct SignalReceiver<T> {
    replay: Option<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> SignalReceiver<T> {
    /// Receive the next value
    ///
    /// Yields the replayed latest value first, then live emissions. A
    /// receiver that lags behind skips to the oldest retained value rather
    /// than erroring. Returns `None` once the signal is dropped and the
    /// backlog is drained.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Signal receiver lagged, skipping ahead");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without waiting; `None` if nothing is pending
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_live_subscriber_receives_emissions() {
        let signal: Signal<u32> = Signal::new();
        let mut rx = signal.subscribe();

        signal.emit(1);
        signal.emit(2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_latest() {
        let signal: Signal<u32> = Signal::new();
        signal.emit(1);
        signal.emit(2);

        let mut rx = signal.subscribe();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let signal: Signal<&'static str> = Signal::new();
        signal.emit("old");

        let mut rx = signal.subscribe();
        signal.emit("new");

        assert_eq!(rx.recv().await, Some("old"));
        assert_eq!(rx.recv().await, Some("new"));
    }

    #[tokio::test]
    async fn test_subscriber_with_no_history_blocks_until_emit() {
        let signal: Signal<u32> = Signal::new();
        let mut rx = signal.subscribe();
        assert_eq!(rx.try_recv(), None);

        signal.emit(7);
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_stored() {
        let signal: Signal<u32> = Signal::new();
        signal.emit(42);

        let mut rx = signal.subscribe();
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let signal: Signal<u32> = Signal::new();
        let mut rx1 = signal.subscribe();
        let mut rx2 = signal.subscribe();

        signal.emit(9);

        assert_eq!(rx1.recv().await, Some(9));
        assert_eq!(rx2.recv().await, Some(9));
    }
}
