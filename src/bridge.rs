//! Output delivery from the transport to session surfaces.
//!
//! A subscription is opened when a session starts connecting and activated
//! once it is `Connected`. Push transports feed a single dispatcher that
//! routes each event by session id into that session's ordered queue; the
//! queue is held back until activation so nothing printed during the
//! handshake is lost. Poll transports get one timer per session that only
//! fetches while the session is connected and the window is in the
//! foreground.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::session::{RegistryError, SessionId, SessionRegistry, SessionState};
use crate::surface::Notice;
use crate::transport::{DeliveryMode, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
}

impl BridgeConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}

struct Subscription {
    generation: u64,
    /// Push mode only.
    queue: Option<mpsc::UnboundedSender<TransportEvent>>,
    active: watch::Sender<bool>,
    polling: Arc<AtomicBool>,
    stop: CancellationToken,
}

struct BridgeInner {
    registry: SessionRegistry,
    transport: Arc<dyn Transport>,
    mode: DeliveryMode,
    config: BridgeConfig,
    subscriptions: Mutex<HashMap<SessionId, Subscription>>,
    foreground: watch::Sender<bool>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct OutputBridge {
    inner: Arc<BridgeInner>,
}

impl OutputBridge {
    /// Create the bridge. For push transports this takes the transport's
    /// event stream and spawns the dispatcher, so it must run inside a
    /// Tokio runtime.
    pub fn new(registry: SessionRegistry, transport: Arc<dyn Transport>, config: BridgeConfig) -> Self {
        let mode = transport.delivery_mode();
        let events = match mode {
            DeliveryMode::Push => transport.take_events(),
            DeliveryMode::Poll => None,
        };
        let (foreground, _) = watch::channel(true);
        let inner = Arc::new(BridgeInner {
            registry,
            transport,
            mode,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            foreground,
            next_generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        match events {
            Some(rx) => spawn_dispatcher(Arc::downgrade(&inner), rx, inner.shutdown.clone()),
            None if mode == DeliveryMode::Push => {
                tracing::warn!("push transport has no event stream; output will not be delivered");
            }
            None => {}
        }

        Self { inner }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.inner.mode
    }

    /// Open a subscription for a session that is about to connect. Output
    /// pushed for it is queued until [`OutputBridge::start`]. Returns
    /// `false` if the session is gone, not connecting or connected, or
    /// already subscribed.
    pub fn prepare(&self, id: SessionId) -> bool {
        let Some(session) = self.inner.registry.get(id) else {
            return false;
        };
        if !session.state().is_live() {
            tracing::debug!(session = %id, state = %session.state(), "no subscription for idle session");
            return false;
        }
        let mut subs = self.inner.subscriptions.lock();
        if subs.contains_key(&id) {
            return false;
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let stop = session.cancelled.child_token();
        let (active, active_rx) = watch::channel(false);
        let polling = Arc::new(AtomicBool::new(false));

        let queue = match self.inner.mode {
            DeliveryMode::Push => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(push_loop(
                    self.inner.clone(),
                    id,
                    generation,
                    rx,
                    active_rx,
                    stop.clone(),
                ));
                Some(tx)
            }
            DeliveryMode::Poll => {
                tokio::spawn(poll_loop(
                    self.inner.clone(),
                    id,
                    generation,
                    active_rx,
                    polling.clone(),
                    stop.clone(),
                ));
                None
            }
        };

        subs.insert(
            id,
            Subscription {
                generation,
                queue,
                active,
                polling,
                stop,
            },
        );
        tracing::debug!(session = %id, mode = %self.inner.mode, "output subscription opened");
        true
    }

    /// Begin delivering output to the session's surface. Opens the
    /// subscription first if needed. Only a `Connected` session is started.
    pub fn start(&self, id: SessionId) -> bool {
        if self.inner.registry.state(id) != Some(SessionState::Connected) {
            tracing::debug!(session = %id, "not connected, output not started");
            return false;
        }
        self.prepare(id);
        let subs = self.inner.subscriptions.lock();
        match subs.get(&id) {
            Some(sub) => {
                sub.active.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Drop the session's subscription and anything still queued. Idempotent.
    pub fn stop(&self, id: SessionId) {
        if let Some(sub) = self.inner.subscriptions.lock().remove(&id) {
            sub.stop.cancel();
            sub.polling.store(false, Ordering::Release);
            tracing::debug!(session = %id, "output subscription closed");
        }
    }

    /// Window visibility. Poll timers are suspended while in the background.
    pub fn set_foreground(&self, foreground: bool) {
        let prev = self.inner.foreground.send_replace(foreground);
        if prev != foreground {
            tracing::debug!(foreground, "window visibility changed");
        }
    }

    pub fn is_foreground(&self) -> bool {
        *self.inner.foreground.borrow()
    }

    /// Whether the session's poll timer is currently running.
    pub fn is_polling(&self, id: SessionId) -> bool {
        self.inner
            .subscriptions
            .lock()
            .get(&id)
            .is_some_and(|s| s.polling.load(Ordering::Acquire))
    }

    pub fn is_subscribed(&self, id: SessionId) -> bool {
        self.inner.subscriptions.lock().contains_key(&id)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Stop the dispatcher and every subscription.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let subs: Vec<_> = self.inner.subscriptions.lock().drain().collect();
        for (_, sub) in subs {
            sub.stop.cancel();
        }
    }
}

impl BridgeInner {
    fn dispatch(&self, event: TransportEvent) {
        let id = event.session_id();
        let subs = self.subscriptions.lock();
        match subs.get(&id).and_then(|s| s.queue.as_ref()) {
            Some(queue) => {
                if queue.send(event).is_err() {
                    tracing::debug!(session = %id, "subscription closing, event dropped");
                }
            }
            None => tracing::debug!(session = %id, "event for unknown session dropped"),
        }
    }

    /// Write a chunk to the session's surface if it is still connected.
    fn deliver(&self, id: SessionId, data: &[u8]) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if session.state() != SessionState::Connected {
            tracing::debug!(session = %id, state = %session.state(), "output after disconnect dropped");
            return;
        }
        session.surface.write(data);
        session.activity.record(data.len());
    }

    /// The remote stream ended: drop the subscription, mark the session
    /// disconnected and tell the user. A no-op if something else already
    /// moved it on.
    async fn end(&self, id: SessionId, generation: u64, notice: Notice) {
        self.release(id, generation);
        match self.registry.transition(id, SessionState::Disconnected) {
            Ok(_) => {
                if let Some(session) = self.registry.get(id) {
                    notice.write_to(session.surface.as_ref());
                }
                tracing::info!(session = %id, "session disconnected by remote");
                self.transport.disconnect(id).await;
            }
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => tracing::debug!(session = %id, error = %e, "ignoring end of stream"),
        }
    }

    fn release(&self, id: SessionId, generation: u64) {
        let mut subs = self.subscriptions.lock();
        if subs.get(&id).is_some_and(|s| s.generation == generation) {
            subs.remove(&id);
        }
    }
}

fn spawn_dispatcher(
    inner: Weak<BridgeInner>,
    mut events: mpsc::Receiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.dispatch(event);
        }
        tracing::debug!("output dispatcher stopped");
    });
}

/// Wait until the subscription is activated. Returns `false` if it was
/// stopped first.
async fn wait_active(active: &mut watch::Receiver<bool>, stop: &CancellationToken) -> bool {
    loop {
        if *active.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = stop.cancelled() => return false,
            res = active.changed() => {
                if res.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn push_loop(
    inner: Arc<BridgeInner>,
    id: SessionId,
    generation: u64,
    mut queue: mpsc::UnboundedReceiver<TransportEvent>,
    mut active: watch::Receiver<bool>,
    stop: CancellationToken,
) {
    if wait_active(&mut active, &stop).await {
        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = queue.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if event.session_id() != id {
                tracing::debug!(session = %id, other = %event.session_id(), "mismatched event dropped");
                continue;
            }
            match event {
                TransportEvent::Output { data, .. } => inner.deliver(id, &data),
                TransportEvent::Closed { reason, .. } => {
                    inner.end(id, generation, Notice::Closed(reason)).await;
                    break;
                }
                TransportEvent::Error { message, .. } => {
                    tracing::warn!(session = %id, error = %message, "stream error");
                    inner.end(id, generation, Notice::StreamError(message)).await;
                    break;
                }
            }
        }
    }
    inner.release(id, generation);
}

async fn poll_loop(
    inner: Arc<BridgeInner>,
    id: SessionId,
    generation: u64,
    mut active: watch::Receiver<bool>,
    polling: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let mut foreground = inner.foreground.subscribe();

    'outer: loop {
        if !wait_active(&mut active, &stop).await {
            break;
        }
        while !*foreground.borrow_and_update() {
            tokio::select! {
                _ = stop.cancelled() => break 'outer,
                res = foreground.changed() => {
                    if res.is_err() {
                        break 'outer;
                    }
                }
            }
        }

        polling.store(true, Ordering::Release);
        tracing::trace!(session = %id, "poll timer running");
        let mut ticker = tokio::time::interval(inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break 'outer,
                res = foreground.changed() => {
                    if res.is_err() {
                        break 'outer;
                    }
                    if !*foreground.borrow_and_update() {
                        polling.store(false, Ordering::Release);
                        tracing::trace!(session = %id, "poll timer suspended");
                        continue 'outer;
                    }
                }
                _ = ticker.tick() => {
                    if inner.registry.state(id) != Some(SessionState::Connected) {
                        break 'outer;
                    }
                    match inner.transport.fetch(id).await {
                        Ok(Some(data)) => inner.deliver(id, &data),
                        Ok(None) => {}
                        Err(TransportError::Closed(reason)) => {
                            inner.end(id, generation, Notice::Closed(reason)).await;
                            break 'outer;
                        }
                        Err(e) => tracing::warn!(session = %id, error = %e, "poll read failed"),
                    }
                }
            }
        }
    }

    polling.store(false, Ordering::Release);
    inner.release(id, generation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_poll_interval() {
        assert_eq!(BridgeConfig::default().poll_interval, Duration::from_millis(100));
    }
}
