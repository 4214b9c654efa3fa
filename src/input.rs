//! Keyboard and resize routing from terminal surfaces to the transport.
//!
//! Each session gets one forwarding task. It reads the surface's input
//! stream and an injection queue (initial payloads, fan-out scripts) and
//! forwards both through the same gate: the session state is re-read from
//! the registry for every chunk, and anything arriving while the session is
//! not `Connected` is dropped rather than queued.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionId, SessionRegistry, SessionState};
use crate::surface::SurfaceEvent;
use crate::transport::Transport;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InputError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session {0} has no input route")]
    NotAttached(SessionId),
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    #[error("input stream of session {0} was already taken")]
    AlreadyTaken(SessionId),
}

struct Route {
    generation: u64,
    inject_tx: mpsc::UnboundedSender<Bytes>,
    stop: CancellationToken,
}

struct RouterInner {
    registry: SessionRegistry,
    transport: Arc<dyn Transport>,
    routes: Mutex<HashMap<SessionId, Route>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct InputRouter {
    inner: Arc<RouterInner>,
}

impl InputRouter {
    pub fn new(registry: SessionRegistry, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                transport,
                routes: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to the session's surface input. A second call for the same
    /// session is a no-op.
    pub fn attach(&self, id: SessionId) -> Result<(), InputError> {
        let session = self.inner.registry.get(id).ok_or(InputError::NotFound(id))?;
        let mut routes = self.inner.routes.lock();
        if routes.contains_key(&id) {
            return Ok(());
        }
        let events = session.surface.take_events().ok_or(InputError::AlreadyTaken(id))?;
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let stop = session.cancelled.child_token();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        routes.insert(
            id,
            Route {
                generation,
                inject_tx,
                stop: stop.clone(),
            },
        );
        drop(routes);

        tokio::spawn(forward_loop(self.inner.clone(), id, generation, events, inject_rx, stop));
        tracing::debug!(session = %id, "input route attached");
        Ok(())
    }

    /// Send `data` to a connected session through the keystroke path.
    pub fn inject(&self, id: SessionId, data: Bytes) -> Result<(), InputError> {
        match self.inner.registry.state(id) {
            None => return Err(InputError::NotFound(id)),
            Some(SessionState::Connected) => {}
            Some(_) => return Err(InputError::NotConnected(id)),
        }
        let routes = self.inner.routes.lock();
        let route = routes.get(&id).ok_or(InputError::NotAttached(id))?;
        route
            .inject_tx
            .send(data)
            .map_err(|_| InputError::NotAttached(id))
    }

    /// Stop routing input for `id`. Idempotent.
    pub fn detach(&self, id: SessionId) {
        if let Some(route) = self.inner.routes.lock().remove(&id) {
            route.stop.cancel();
            tracing::debug!(session = %id, "input route detached");
        }
    }

    pub fn is_attached(&self, id: SessionId) -> bool {
        self.inner.routes.lock().contains_key(&id)
    }
}

impl RouterInner {
    async fn forward(&self, id: SessionId, data: Bytes) {
        match self.registry.state(id) {
            Some(SessionState::Connected) => {
                if let Err(e) = self.transport.send(id, data).await {
                    tracing::warn!(session = %id, error = %e, "failed to forward input");
                }
            }
            Some(state) => {
                tracing::trace!(session = %id, %state, len = data.len(), "dropping input while not connected");
            }
            None => {}
        }
    }

    async fn resize(&self, id: SessionId, cols: u16, rows: u16) {
        if !self.registry.update(id, |s| s.size = Some((cols, rows))) {
            return;
        }
        if self.registry.state(id) == Some(SessionState::Connected) {
            self.transport.resize(id, cols, rows).await;
        }
    }
}

async fn forward_loop(
    inner: Arc<RouterInner>,
    id: SessionId,
    generation: u64,
    mut events: mpsc::Receiver<SurfaceEvent>,
    mut injected: mpsc::UnboundedReceiver<Bytes>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Some(SurfaceEvent::Input(data)) => inner.forward(id, data).await,
                Some(SurfaceEvent::Resize { cols, rows }) => inner.resize(id, cols, rows).await,
                None => break,
            },
            data = injected.recv() => match data {
                Some(data) => inner.forward(id, data).await,
                None => break,
            },
        }
    }

    let mut routes = inner.routes.lock();
    if routes.get(&id).is_some_and(|r| r.generation == generation) {
        routes.remove(&id);
    }
}

/// `payload` as a line the remote shell will execute: a trailing newline is
/// appended unless one is already there.
pub fn command_line(payload: &str) -> Bytes {
    if payload.ends_with('\n') {
        Bytes::copy_from_slice(payload.as_bytes())
    } else {
        Bytes::from(format!("{payload}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_appends_newline_once() {
        assert_eq!(command_line("uptime"), Bytes::from_static(b"uptime\n"));
        assert_eq!(command_line("uptime\n"), Bytes::from_static(b"uptime\n"));
        assert_eq!(command_line("a\nb"), Bytes::from_static(b"a\nb\n"));
    }
}
