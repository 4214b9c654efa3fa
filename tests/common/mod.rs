#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use shellmux::config::EngineConfig;
use shellmux::events::EventHub;
use shellmux::manager::SessionManager;
use shellmux::session::{SessionId, SessionRegistry, SessionState};
use shellmux::surface::BufferSurfaces;
use shellmux::target::{AuthKind, ConnectionTarget, TargetBook, TargetId};
use shellmux::transport::{DeliveryMode, Transport, TransportError, TransportEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// What a poll-mode fetch returns next.
#[derive(Debug, Clone)]
pub enum PollItem {
    Data(&'static str),
    Closed,
    Error(&'static str),
}

#[derive(Default)]
struct Calls {
    connects: Vec<(SessionId, TargetId)>,
    sends: Vec<(SessionId, Bytes)>,
    resizes: Vec<(SessionId, u16, u16)>,
    disconnects: Vec<SessionId>,
    failing_hosts: HashSet<String>,
    poll_queue: HashMap<SessionId, VecDeque<PollItem>>,
}

/// Scriptable in-memory transport that records every call.
pub struct MockTransport {
    mode: DeliveryMode,
    hub: EventHub,
    calls: Mutex<Calls>,
    gate: watch::Sender<bool>,
    resize_gate: watch::Sender<bool>,
    fetches: AtomicUsize,
}

impl MockTransport {
    pub fn new(mode: DeliveryMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            hub: EventHub::new(),
            calls: Mutex::new(Calls::default()),
            gate: watch::channel(true).0,
            resize_gate: watch::channel(true).0,
            fetches: AtomicUsize::new(0),
        })
    }

    /// Make `connect` wait until [`MockTransport::release_connects`].
    pub fn hold_connects(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_connects(&self) {
        self.gate.send_replace(true);
    }

    /// Make `resize` wait until [`MockTransport::release_resizes`].
    pub fn hold_resizes(&self) {
        self.resize_gate.send_replace(false);
    }

    pub fn release_resizes(&self) {
        self.resize_gate.send_replace(true);
    }

    pub fn fail_host(&self, host: &str) {
        self.calls.lock().failing_hosts.insert(host.to_string());
    }

    pub async fn push(&self, session_id: SessionId, data: &str) {
        self.hub
            .publish(TransportEvent::Output {
                session_id,
                data: Bytes::copy_from_slice(data.as_bytes()),
            })
            .await;
    }

    pub async fn close(&self, session_id: SessionId) {
        self.hub
            .publish(TransportEvent::Closed {
                session_id,
                reason: None,
            })
            .await;
    }

    pub async fn fail_stream(&self, session_id: SessionId, message: &str) {
        self.hub
            .publish(TransportEvent::Error {
                session_id,
                message: message.to_string(),
            })
            .await;
    }

    pub fn queue_poll(&self, session_id: SessionId, item: PollItem) {
        self.calls
            .lock()
            .poll_queue
            .entry(session_id)
            .or_default()
            .push_back(item);
    }

    pub fn connect_count(&self) -> usize {
        self.calls.lock().connects.len()
    }

    pub fn connects_for(&self, session_id: SessionId) -> usize {
        self.calls
            .lock()
            .connects
            .iter()
            .filter(|(id, _)| *id == session_id)
            .count()
    }

    /// Everything sent to `session_id`, concatenated.
    pub fn sent(&self, session_id: SessionId) -> String {
        self.calls
            .lock()
            .sends
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, data)| String::from_utf8_lossy(data).into_owned())
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.calls.lock().sends.len()
    }

    pub fn resizes(&self, session_id: SessionId) -> Vec<(u16, u16)> {
        self.calls
            .lock()
            .resizes
            .iter()
            .filter(|(id, _, _)| *id == session_id)
            .map(|&(_, cols, rows)| (cols, rows))
            .collect()
    }

    pub fn disconnects(&self, session_id: SessionId) -> usize {
        self.calls
            .lock()
            .disconnects
            .iter()
            .filter(|id| **id == session_id)
            .count()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        match self.mode {
            DeliveryMode::Push => self.hub.take(),
            DeliveryMode::Poll => None,
        }
    }

    async fn connect(&self, target: &ConnectionTarget, session_id: SessionId) -> Result<(), TransportError> {
        self.calls.lock().connects.push((session_id, target.id.clone()));
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if self.calls.lock().failing_hosts.contains(&target.host) {
            return Err(TransportError::ConnectFailed {
                target: target.label(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn send(&self, session_id: SessionId, data: Bytes) -> Result<(), TransportError> {
        self.calls.lock().sends.push((session_id, data));
        Ok(())
    }

    async fn resize(&self, session_id: SessionId, cols: u16, rows: u16) {
        self.calls.lock().resizes.push((session_id, cols, rows));
        let mut gate = self.resize_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    async fn disconnect(&self, session_id: SessionId) {
        self.calls.lock().disconnects.push(session_id);
    }

    async fn fetch(&self, session_id: SessionId) -> Result<Option<Bytes>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self
            .calls
            .lock()
            .poll_queue
            .get_mut(&session_id)
            .and_then(|q| q.pop_front());
        match next {
            None => Ok(None),
            Some(PollItem::Data(s)) => Ok(Some(Bytes::from_static(s.as_bytes()))),
            Some(PollItem::Closed) => Err(TransportError::Closed(None)),
            Some(PollItem::Error(msg)) => Err(TransportError::Read(msg.to_string())),
        }
    }
}

/// A target that needs no credentials.
pub fn open_target(id: &str) -> ConnectionTarget {
    ConnectionTarget::new(id, format!("{id}.example"), "root", AuthKind::None)
}

/// A password target with no password stored.
pub fn password_target(id: &str) -> ConnectionTarget {
    ConnectionTarget::new(id, format!("{id}.example"), "root", AuthKind::Password)
}

pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 10,
        settle_delay_ms: 50,
        max_sessions: 64,
    }
}

pub struct Harness {
    pub manager: SessionManager,
    pub transport: Arc<MockTransport>,
    pub surfaces: BufferSurfaces,
    pub book: TargetBook,
}

impl Harness {
    pub fn new(mode: DeliveryMode, targets: Vec<ConnectionTarget>) -> Self {
        Self::with_surfaces(mode, targets, BufferSurfaces::new())
    }

    pub fn with_surfaces(mode: DeliveryMode, targets: Vec<ConnectionTarget>, surfaces: BufferSurfaces) -> Self {
        let transport = MockTransport::new(mode);
        let book = TargetBook::from_targets(targets).expect("valid test targets");
        let manager = SessionManager::new(
            transport.clone(),
            Arc::new(book.clone()),
            Arc::new(surfaces.clone()),
            test_engine_config(),
        );
        Self {
            manager,
            transport,
            surfaces,
            book,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.manager.registry()
    }

    /// Open a session for `target` and start connecting it.
    pub fn start(&self, target: &str, payload: Option<&str>) -> SessionId {
        self.manager
            .open_and_connect(&TargetId::new(target), payload.map(str::to_string))
            .expect("open session")
    }

    pub fn output(&self, id: SessionId) -> String {
        self.surfaces.get(id).map(|s| s.contents()).unwrap_or_default()
    }

    pub async fn connected(&self, target: &str, payload: Option<&str>) -> SessionId {
        let id = self.start(target, payload);
        wait_for_state(self.registry(), id, SessionState::Connected).await;
        id
    }
}

/// Wait until `condition` holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(registry: &SessionRegistry, id: SessionId, state: SessionState) {
    eventually(&format!("session {id} to reach {state}"), || {
        registry.state(id) == Some(state)
    })
    .await;
}
