//! Running one command on many targets at once.

use futures::future::join_all;
use std::collections::HashSet;

use crate::input::{command_line, InputRouter};
use crate::manager::ManagerError;
use crate::session::{SessionId, SessionRegistry, SessionState};
use crate::target::TargetId;

/// Something a fan-out can be aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FanoutTarget {
    /// An existing session. If it is not connected, a new session is opened
    /// for the same target instead.
    Session(SessionId),
    /// A target; its most recent connected session is reused if there is one.
    Target(TargetId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutJob {
    pub payload: String,
    pub targets: Vec<FanoutTarget>,
}

impl FanoutJob {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            targets: Vec::new(),
        }
    }

    pub fn target(mut self, target: FanoutTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = FanoutTarget>) -> Self {
        self.targets.extend(targets);
        self
    }
}

/// What happened for one fan-out target. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Typed into an already connected session.
    Injected { target: FanoutTarget, session: SessionId },
    /// A new session was opened with the payload as its initial command.
    Opened { target: FanoutTarget, session: SessionId },
    Failed { target: FanoutTarget, reason: String },
}

impl Dispatch {
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Dispatch::Injected { session, .. } | Dispatch::Opened { session, .. } => Some(*session),
            Dispatch::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Dispatch::Failed { .. })
    }
}

/// Opens and connects a new session for a target.
pub trait SessionOpener: Send + Sync {
    fn open_session(&self, target_id: &TargetId, initial_payload: Option<String>) -> Result<SessionId, ManagerError>;
}

pub struct FanoutExecutor<'a> {
    registry: &'a SessionRegistry,
    input: &'a InputRouter,
    opener: &'a dyn SessionOpener,
}

impl<'a> FanoutExecutor<'a> {
    pub fn new(registry: &'a SessionRegistry, input: &'a InputRouter, opener: &'a dyn SessionOpener) -> Self {
        Self {
            registry,
            input,
            opener,
        }
    }

    /// Dispatch `job` to every target independently. A failure for one
    /// target never affects the others; duplicate targets run once.
    pub async fn execute(&self, job: FanoutJob) -> Vec<Dispatch> {
        let mut seen = HashSet::new();
        let targets: Vec<_> = job
            .targets
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        let payload = job.payload.as_str();

        let dispatches = join_all(
            targets
                .into_iter()
                .map(|target| async move { self.dispatch(payload, target) }),
        )
        .await;

        let failed = dispatches.iter().filter(|d| d.is_failed()).count();
        tracing::info!(targets = dispatches.len(), failed, "fan-out dispatched");
        dispatches
    }

    fn dispatch(&self, payload: &str, target: FanoutTarget) -> Dispatch {
        let (existing, target_id) = match &target {
            FanoutTarget::Session(id) => match self.registry.get(*id) {
                Some(session) => {
                    let connected = (session.state() == SessionState::Connected).then_some(*id);
                    (connected, session.target_id)
                }
                None => {
                    let reason = format!("session not found: {id}");
                    tracing::warn!(session = %id, "fan-out target session is gone");
                    return Dispatch::Failed {
                        target: target.clone(),
                        reason,
                    };
                }
            },
            FanoutTarget::Target(tid) => (self.registry.find_connected(tid), tid.clone()),
        };

        if let Some(session) = existing {
            match self.input.inject(session, command_line(payload)) {
                Ok(()) => return Dispatch::Injected { target, session },
                Err(e) => {
                    tracing::debug!(session = %session, error = %e, "inject failed, opening a new session");
                }
            }
        }

        match self.opener.open_session(&target_id, Some(payload.to_string())) {
            Ok(session) => Dispatch::Opened { target, session },
            Err(e) => {
                tracing::warn!(target = %target_id, error = %e, "fan-out failed for target");
                Dispatch::Failed {
                    target,
                    reason: e.to_string(),
                }
            }
        }
    }
}
