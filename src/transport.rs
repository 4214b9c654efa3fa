//! The transport seam: whatever actually carries bytes to and from remote
//! shells. The engine only ever talks to [`Transport`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::SessionId;
use crate::target::ConnectionTarget;

/// How remote output reaches the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The transport publishes [`TransportEvent`]s as output arrives.
    #[default]
    Push,
    /// The engine calls [`Transport::fetch`] on a timer.
    Poll,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Push => f.write_str("push"),
            DeliveryMode::Poll => f.write_str("poll"),
        }
    }
}

/// Pushed transport events. Each carries the originating session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Output { session_id: SessionId, data: Bytes },
    Closed { session_id: SessionId, reason: Option<String> },
    Error { session_id: SessionId, message: String },
}

impl TransportEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            TransportEvent::Output { session_id, .. }
            | TransportEvent::Closed { session_id, .. }
            | TransportEvent::Error { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {target} failed: {reason}")]
    ConnectFailed { target: String, reason: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("session {0} is not connected")]
    NotConnected(SessionId),

    #[error("session {0} is already connected")]
    AlreadyConnected(SessionId),

    /// The remote stream ended. Authoritative, unlike read errors.
    #[error("stream closed{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed(Option<String>),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque connect/send/resize/disconnect surface over remote shells.
///
/// Implementations must be safe to call concurrently for different session
/// ids. `resize` and `disconnect` are best effort.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn delivery_mode(&self) -> DeliveryMode;

    /// Hand over the push event stream. Push transports return it once;
    /// every later call, and every poll transport, returns `None`.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        None
    }

    async fn connect(&self, target: &ConnectionTarget, session_id: SessionId) -> Result<(), TransportError>;

    async fn send(&self, session_id: SessionId, data: Bytes) -> Result<(), TransportError>;

    async fn resize(&self, session_id: SessionId, cols: u16, rows: u16);

    async fn disconnect(&self, session_id: SessionId);

    /// Drain buffered output. `Ok(None)` means nothing new.
    async fn fetch(&self, session_id: SessionId) -> Result<Option<Bytes>, TransportError> {
        let _ = session_id;
        Ok(None)
    }
}
