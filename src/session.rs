use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::OutputActivity;
use crate::surface::TerminalSurface;
use crate::target::TargetId;

/// Opaque session identifier. Allocated by the registry and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    AwaitingCredentials,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Disconnected` re-enters the connect path only through an explicit
    /// reconnect request; nothing else leaves it.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, AwaitingCredentials)
                | (AwaitingCredentials, Connecting)
                | (AwaitingCredentials, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Failed, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Connecting)
                | (Disconnected, AwaitingCredentials)
        )
    }

    /// States from which a connect request starts a new attempt.
    pub fn accepts_connect(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Disconnected)
    }

    /// `Connecting` or `Connected`: the transport holds resources for this session.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingCredentials => "awaiting_credentials",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One interactive remote-shell session and its terminal surface.
///
/// The registry hands out clones; a clone is a snapshot of the record at the
/// time of the read. `state` can only change through
/// [`SessionRegistry::transition`].
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub target_id: TargetId,
    /// Tab title, usually the target's display name.
    pub title: String,
    state: SessionState,
    /// Command text to run once the shell is ready. Cleared when consumed.
    pub initial_payload: Option<String>,
    pub created_at: Instant,
    /// Creation sequence number; strictly increasing across the registry.
    pub seq: u64,
    /// Last known surface size as `(cols, rows)`.
    pub size: Option<(u16, u16)>,
    pub last_error: Option<String>,
    pub surface: Arc<dyn TerminalSurface>,
    pub activity: OutputActivity,
    /// Fires when the session is removed. Every per-session task selects on it.
    pub cancelled: CancellationToken,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target_id", &self.target_id)
            .field("title", &self.title)
            .field("state", &self.state)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Registry lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: SessionId, target_id: TargetId },
    StateChanged { id: SessionId, from: SessionState, to: SessionState },
    Focused { id: Option<SessionId> },
    Removed { id: SessionId },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("session {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
}

struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    focused: Option<SessionId>,
    next_seq: u64,
    max_sessions: Option<usize>,
}

impl RegistryInner {
    fn most_recent(&self) -> Option<SessionId> {
        self.sessions.values().max_by_key(|s| s.seq).map(|s| s.id)
    }
}

/// Canonical set of sessions. The only shared mutable state in the engine.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Default cap on concurrent sessions.
    ///
    /// Each live session costs a transport connection plus three tasks
    /// (input, output, settle timer).
    pub const DEFAULT_MAX_SESSIONS: usize = 64;

    pub fn new() -> Self {
        Self::with_max_sessions(Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                focused: None,
                next_seq: 0,
                max_sessions,
            })),
            events_tx,
        }
    }

    /// Allocate a new `Idle` session and focus it.
    ///
    /// `surface` is called with the freshly allocated id, outside the
    /// registry lock. If the registry is full the surface is disposed again.
    pub fn create<F>(
        &self,
        target_id: TargetId,
        title: String,
        initial_payload: Option<String>,
        surface: F,
    ) -> Result<SessionId, RegistryError>
    where
        F: FnOnce(SessionId) -> Arc<dyn TerminalSurface>,
    {
        if self.is_full() {
            return Err(RegistryError::MaxSessionsReached);
        }
        let id = SessionId::generate();
        let surface = surface(id);
        let size = surface.size();

        let mut inner = self.inner.write();
        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                drop(inner);
                surface.dispose();
                return Err(RegistryError::MaxSessionsReached);
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.sessions.insert(
            id,
            Session {
                id,
                target_id: target_id.clone(),
                title,
                state: SessionState::Idle,
                initial_payload: initial_payload.filter(|p| !p.is_empty()),
                created_at: Instant::now(),
                seq,
                size,
                last_error: None,
                surface,
                activity: OutputActivity::new(),
                cancelled: CancellationToken::new(),
            },
        );
        inner.focused = Some(id);
        let _ = self.events_tx.send(SessionEvent::Created { id, target_id });
        let _ = self.events_tx.send(SessionEvent::Focused { id: Some(id) });
        tracing::debug!(session = %id, seq, "session created");
        Ok(id)
    }

    /// Snapshot of a session, if it still exists.
    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.read().sessions.get(&id).cloned()
    }

    /// Current state without cloning the whole record.
    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.inner.read().sessions.get(&id).map(|s| s.state)
    }

    /// Apply `f` to the stored record. Returns `false` when the session is
    /// gone; callers treat that as a benign race, not an error.
    pub fn update<F>(&self, id: SessionId, f: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(&id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    /// Move a session to `to`, validated against the state table under the
    /// write lock. Returns the previous state.
    pub fn transition(&self, id: SessionId, to: SessionState) -> Result<SessionState, RegistryError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        let from = session.state;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition { id, from, to });
        }
        session.state = to;
        let _ = self.events_tx.send(SessionEvent::StateChanged { id, from, to });
        tracing::debug!(session = %id, %from, %to, "session state changed");
        Ok(from)
    }

    /// Take the initial payload, but only while the session is connected.
    pub fn take_initial_payload(&self, id: SessionId) -> Option<String> {
        let mut inner = self.inner.write();
        let session = inner.sessions.get_mut(&id)?;
        if session.state != SessionState::Connected {
            return None;
        }
        session.initial_payload.take()
    }

    /// Remove a session and cancel everything tied to its token.
    ///
    /// If the removed session had focus, focus moves to the most recently
    /// created remaining session.
    pub fn remove(&self, id: SessionId) -> Option<Session> {
        let mut inner = self.inner.write();
        let removed = inner.sessions.remove(&id)?;
        removed.cancelled.cancel();
        let _ = self.events_tx.send(SessionEvent::Removed { id });
        if inner.focused == Some(id) {
            let next = inner.most_recent();
            inner.focused = next;
            let _ = self.events_tx.send(SessionEvent::Focused { id: next });
        }
        tracing::debug!(session = %id, "session removed");
        Some(removed)
    }

    /// Remove every session at once. Used on shutdown.
    pub fn drain(&self) -> Vec<Session> {
        let mut inner = self.inner.write();
        let mut drained: Vec<Session> = inner.sessions.drain().map(|(_, s)| s).collect();
        drained.sort_by_key(|s| s.seq);
        for session in &drained {
            session.cancelled.cancel();
            let _ = self.events_tx.send(SessionEvent::Removed { id: session.id });
        }
        if inner.focused.take().is_some() {
            let _ = self.events_tx.send(SessionEvent::Focused { id: None });
        }
        drained
    }

    pub fn focus(&self, id: SessionId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if !inner.sessions.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        if inner.focused != Some(id) {
            inner.focused = Some(id);
            let _ = self.events_tx.send(SessionEvent::Focused { id: Some(id) });
        }
        Ok(())
    }

    pub fn focused(&self) -> Option<SessionId> {
        self.inner.read().focused
    }

    /// All sessions in creation (tab) order.
    pub fn list(&self) -> Vec<Session> {
        let inner = self.inner.read();
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.seq);
        sessions
    }

    /// The most recently created `Connected` session bound to `target_id`.
    pub fn find_connected(&self, target_id: &TargetId) -> Option<SessionId> {
        let inner = self.inner.read();
        inner
            .sessions
            .values()
            .filter(|s| &s.target_id == target_id && s.state == SessionState::Connected)
            .max_by_key(|s| s.seq)
            .map(|s| s.id)
    }

    /// Number of sessions that are `Connecting` or `Connected`.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.read();
        inner.sessions.values().filter(|s| s.state.is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        let inner = self.inner.read();
        inner
            .max_sessions
            .map(|max| inner.sessions.len() >= max)
            .unwrap_or(false)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
