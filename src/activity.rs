use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Tracks output delivered to one session's surface.
///
/// The bridge calls [`OutputActivity::record`] for every chunk it writes.
/// Scripted runs use [`OutputActivity::wait_for_quiet`] to decide that a
/// command has finished printing.
#[derive(Clone)]
pub struct OutputActivity {
    last: Arc<watch::Sender<Option<Instant>>>,
    bytes: Arc<AtomicU64>,
}

impl Default for OutputActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputActivity {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            last: Arc::new(tx),
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record `len` bytes of output delivered now.
    pub fn record(&self, len: usize) {
        self.bytes.fetch_add(len as u64, Ordering::AcqRel);
        self.last.send_replace(Some(Instant::now()));
    }

    /// Total bytes delivered so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    /// Time since the last output, or `None` if nothing arrived yet.
    pub fn since_last(&self) -> Option<Duration> {
        self.last.borrow().map(|t| t.elapsed())
    }

    /// Wait until some output has arrived and then `quiet` has passed
    /// without more.
    pub async fn wait_for_quiet(&self, quiet: Duration) {
        let mut rx = self.last.subscribe();
        loop {
            let last = *rx.borrow_and_update();
            let remaining = match last.map(|t| t.elapsed()) {
                None => None,
                Some(elapsed) if elapsed >= quiet => return,
                Some(elapsed) => Some(quiet - elapsed),
            };
            match remaining {
                None => {
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
                Some(remaining) => {
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        res = rx.changed() => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
