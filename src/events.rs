use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::TransportEvent;

/// Capacity of the push event channel. Output chunks are at most a few KiB,
/// so a full channel holds a few MiB before publishers start to wait.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Publishing half of a push transport's event stream.
///
/// Publishers block (or await) when the consumer falls behind: output must
/// never be dropped, so backpressure travels back to the transport reader
/// instead. The receiving half is handed out exactly once.
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::Sender<TransportEvent>,
    rx: Arc<Mutex<Option<mpsc::Receiver<TransportEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// Publish from async code.
    pub async fn publish(&self, event: TransportEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("event consumer gone, dropping transport event");
        }
    }

    /// Publish from a blocking reader thread.
    pub fn publish_blocking(&self, event: TransportEvent) {
        if self.tx.blocking_send(event).is_err() {
            tracing::debug!("event consumer gone, dropping transport event");
        }
    }

    /// Take the receiving half. Returns `None` after the first call.
    pub fn take(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.rx.lock().take()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
