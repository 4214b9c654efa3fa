//! Drives sessions through the connection state machine.
//!
//! Every step re-reads the session from the registry and changes state only
//! through [`SessionRegistry::transition`]; a missing session means it was
//! closed and the step quietly stops. Transport calls happen in spawned
//! attempts so callers never wait on the network.

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::OutputBridge;
use crate::input::{command_line, InputRouter};
use crate::session::{RegistryError, SessionId, SessionRegistry, SessionState};
use crate::surface::Notice;
use crate::target::{AuthKind, ConnectionTarget, Credentials, TargetError, TargetStore};
use crate::transport::Transport;

/// Delay between `Connected` and sending the initial payload, giving the
/// remote shell time to print its prompt.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// What a connect request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// An attempt is in flight.
    Started,
    /// Paused until credentials are supplied.
    AwaitingCredentials,
    /// The session was already connecting or connected; nothing changed.
    AlreadyActive,
    /// The attempt failed before reaching the transport.
    Failed,
    /// The session no longer exists.
    Stale,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("session {0} is not waiting for credentials")]
    NotAwaitingCredentials(SessionId),

    #[error(transparent)]
    Target(#[from] TargetError),
}

struct ControllerInner {
    registry: SessionRegistry,
    transport: Arc<dyn Transport>,
    targets: Arc<dyn TargetStore>,
    bridge: OutputBridge,
    input: InputRouter,
    settle_delay: Duration,
}

#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<ControllerInner>,
}

impl ConnectionController {
    pub fn new(
        registry: SessionRegistry,
        transport: Arc<dyn Transport>,
        targets: Arc<dyn TargetStore>,
        bridge: OutputBridge,
        input: InputRouter,
        settle_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                registry,
                transport,
                targets,
                bridge,
                input,
                settle_delay,
            }),
        }
    }

    /// Start connecting `id`, or pause for credentials if the target has
    /// none. A session that is already connecting, connected or waiting for
    /// credentials is left alone.
    pub fn connect(&self, id: SessionId) -> ConnectOutcome {
        let inner = &self.inner;
        let Some(session) = inner.registry.get(id) else {
            tracing::debug!(session = %id, "connect for unknown session ignored");
            return ConnectOutcome::Stale;
        };
        if !session.state().accepts_connect() {
            tracing::debug!(session = %id, state = %session.state(), "connect ignored");
            return ConnectOutcome::AlreadyActive;
        }

        let Some(target) = inner.targets.get(&session.target_id) else {
            let reason = format!("unknown target {}", session.target_id);
            return match inner.registry.transition(id, SessionState::Connecting) {
                Ok(_) => {
                    inner.fail(id, reason);
                    ConnectOutcome::Failed
                }
                Err(e) => lost_race(id, e),
            };
        };

        if !target.has_credentials() {
            return match inner.registry.transition(id, SessionState::AwaitingCredentials) {
                Ok(_) => {
                    Notice::CredentialsRequired(target.label()).write_to(session.surface.as_ref());
                    tracing::info!(session = %id, target = %target.id, "waiting for credentials");
                    ConnectOutcome::AwaitingCredentials
                }
                Err(e) => lost_race(id, e),
            };
        }

        self.begin(id, target)
    }

    /// Resume a session paused in `AwaitingCredentials`.
    ///
    /// The credentials are laid over the target's own for this attempt only.
    /// They are written back through the target store only when `remember`
    /// is set. If they still do not satisfy the target's auth kind the
    /// attempt fails; there is no second prompt.
    pub fn supply_credentials(
        &self,
        id: SessionId,
        credentials: Credentials,
        remember: bool,
    ) -> Result<ConnectOutcome, ControllerError> {
        let inner = &self.inner;
        let Some(session) = inner.registry.get(id) else {
            tracing::debug!(session = %id, "credentials for closed session ignored");
            return Ok(ConnectOutcome::Stale);
        };
        if session.state() != SessionState::AwaitingCredentials {
            return Err(ControllerError::NotAwaitingCredentials(id));
        }
        let target = inner
            .targets
            .get(&session.target_id)
            .ok_or_else(|| TargetError::NotFound(session.target_id.clone()))?;

        if remember {
            if let Err(e) = inner.targets.remember_credentials(&target.id, &credentials) {
                tracing::warn!(target = %target.id, error = %e, "failed to remember credentials");
            }
        }

        let target = target.with_credentials(credentials);
        if !target.has_credentials() {
            return Ok(match inner.registry.transition(id, SessionState::Connecting) {
                Ok(_) => {
                    let needed = if target.auth == AuthKind::Key {
                        "a key file"
                    } else {
                        "a password"
                    };
                    inner.fail(id, format!("{needed} is required for {}", target.label()));
                    ConnectOutcome::Failed
                }
                Err(e) => lost_race(id, e),
            });
        }

        Ok(self.begin(id, target))
    }

    /// Dismiss the credential prompt. The session stays open, disconnected.
    pub fn cancel_credentials(&self, id: SessionId) -> bool {
        let inner = &self.inner;
        if inner.registry.state(id) != Some(SessionState::AwaitingCredentials) {
            return false;
        }
        match inner.registry.transition(id, SessionState::Disconnected) {
            Ok(_) => {
                if let Some(session) = inner.registry.get(id) {
                    Notice::CredentialsCancelled.write_to(session.surface.as_ref());
                }
                tracing::info!(session = %id, "credential prompt cancelled");
                true
            }
            Err(_) => false,
        }
    }

    /// Drop the connection but keep the session, so it can reconnect.
    /// A connect still in flight is not interrupted; use [`close`] for that.
    ///
    /// [`close`]: ConnectionController::close
    pub async fn disconnect(&self, id: SessionId) -> bool {
        let inner = &self.inner;
        match inner.registry.state(id) {
            Some(SessionState::Connected) => {}
            Some(SessionState::AwaitingCredentials) => return self.cancel_credentials(id),
            Some(state) => {
                tracing::debug!(session = %id, %state, "disconnect ignored");
                return false;
            }
            None => return false,
        }
        if inner.registry.transition(id, SessionState::Disconnected).is_err() {
            return false;
        }
        inner.bridge.stop(id);
        inner.transport.disconnect(id).await;
        if let Some(session) = inner.registry.get(id) {
            Notice::Closed(None).write_to(session.surface.as_ref());
        }
        tracing::info!(session = %id, "session disconnected");
        true
    }

    /// Tear the session down completely: registry entry, subscriptions,
    /// input route, transport resources and surface. Idempotent.
    pub async fn close(&self, id: SessionId) -> bool {
        let inner = &self.inner;
        let Some(session) = inner.registry.remove(id) else {
            return false;
        };
        inner.bridge.stop(id);
        inner.input.detach(id);
        if session.state().is_live() {
            inner.transport.disconnect(id).await;
        }
        session.surface.dispose();
        tracing::info!(session = %id, target = %session.target_id, "session closed");
        true
    }

    /// Move to `Connecting` and spawn the transport attempt.
    fn begin(&self, id: SessionId, target: ConnectionTarget) -> ConnectOutcome {
        let inner = &self.inner;
        if let Err(e) = inner.registry.transition(id, SessionState::Connecting) {
            return lost_race(id, e);
        }
        let Some(session) = inner.registry.get(id) else {
            return ConnectOutcome::Stale;
        };

        if let Err(e) = inner.input.attach(id) {
            tracing::warn!(session = %id, error = %e, "input route unavailable");
        }
        inner.bridge.prepare(id);
        Notice::Connecting(target.label()).write_to(session.surface.as_ref());
        tracing::info!(session = %id, target = %target.id, "connecting");

        tokio::spawn(attempt(inner.clone(), id, target, session.cancelled.clone()));
        ConnectOutcome::Started
    }
}

/// A transition lost to a concurrent request or a close.
fn lost_race(id: SessionId, err: RegistryError) -> ConnectOutcome {
    match err {
        RegistryError::NotFound(_) => ConnectOutcome::Stale,
        e => {
            tracing::debug!(session = %id, error = %e, "connect lost a race");
            ConnectOutcome::AlreadyActive
        }
    }
}

async fn attempt(
    inner: Arc<ControllerInner>,
    id: SessionId,
    target: ConnectionTarget,
    cancelled: tokio_util::sync::CancellationToken,
) {
    let result = tokio::select! {
        _ = cancelled.cancelled() => {
            tracing::debug!(session = %id, "connect abandoned");
            inner.transport.disconnect(id).await;
            return;
        }
        result = inner.transport.connect(&target, id) => result,
    };

    match result {
        Ok(()) => inner.connected(id, &target).await,
        Err(e) => inner.fail(id, e.to_string()),
    }
}

impl ControllerInner {
    async fn connected(self: &Arc<Self>, id: SessionId, target: &ConnectionTarget) {
        if let Err(e) = self.registry.transition(id, SessionState::Connected) {
            tracing::debug!(session = %id, error = %e, "session went away while connecting");
            self.bridge.stop(id);
            self.transport.disconnect(id).await;
            return;
        }
        let Some(session) = self.registry.get(id) else {
            self.transport.disconnect(id).await;
            return;
        };

        self.registry.update(id, |s| s.last_error = None);
        Notice::Connected(target.label()).write_to(session.surface.as_ref());
        if let Some((cols, rows)) = session.size.or_else(|| session.surface.size()) {
            self.transport.resize(id, cols, rows).await;
            if self.registry.state(id) != Some(SessionState::Connected) {
                tracing::debug!(session = %id, "session left Connected during setup");
                return;
            }
        }
        if !self.bridge.start(id) {
            return;
        }
        tracing::info!(session = %id, target = %target.id, "connected");

        if session.initial_payload.is_some() {
            tokio::spawn(run_initial_payload(
                self.clone(),
                id,
                session.cancelled.clone(),
            ));
        }
    }

    /// `Connecting -> Failed -> Disconnected`, with a red notice.
    fn fail(&self, id: SessionId, reason: String) {
        self.bridge.stop(id);
        self.registry
            .update(id, |s| s.last_error = Some(reason.clone()));
        match self.registry.transition(id, SessionState::Failed) {
            Ok(_) => {}
            Err(RegistryError::NotFound(_)) => return,
            Err(e) => {
                tracing::debug!(session = %id, error = %e, "failure after state moved on");
                return;
            }
        }
        match self.registry.transition(id, SessionState::Disconnected) {
            Ok(_) => {}
            Err(RegistryError::NotFound(_)) => return,
            Err(e) => {
                tracing::debug!(session = %id, error = %e, "failed session did not settle");
                return;
            }
        }
        if let Some(session) = self.registry.get(id) {
            Notice::ConnectFailed(reason.clone()).write_to(session.surface.as_ref());
        }
        tracing::warn!(session = %id, error = %reason, "connection failed");
    }
}

/// Send the session's initial payload once the shell has settled. If the
/// session is no longer connected by then the payload stays put for the
/// next connection.
async fn run_initial_payload(
    inner: Arc<ControllerInner>,
    id: SessionId,
    cancelled: tokio_util::sync::CancellationToken,
) {
    tokio::select! {
        _ = cancelled.cancelled() => return,
        _ = tokio::time::sleep(inner.settle_delay) => {}
    }
    let Some(payload) = inner.registry.take_initial_payload(id) else {
        return;
    };
    match inner.input.inject(id, command_line(&payload)) {
        Ok(()) => tracing::debug!(session = %id, "initial payload sent"),
        Err(e) => tracing::warn!(session = %id, error = %e, "initial payload not sent"),
    }
}
