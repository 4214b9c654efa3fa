//! Connection targets: the remote endpoints sessions connect to.
//!
//! Targets are owned by the caller. The engine only reads them through
//! [`TargetStore`] and writes credentials back when explicitly asked to.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Stable reference to a [`ConnectionTarget`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    Password,
    Key,
    /// No credential material needed: ssh-agent, or a local command.
    None,
}

/// Credential material. Either field may be absent.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            key_path: None,
        }
    }

    pub fn key(path: impl Into<PathBuf>) -> Self {
        Self {
            password: None,
            key_path: Some(path.into()),
        }
    }

    /// Whether this material is enough to authenticate with `auth`.
    pub fn satisfies(&self, auth: AuthKind) -> bool {
        match auth {
            AuthKind::Password => self.password.as_deref().is_some_and(|p| !p.is_empty()),
            AuthKind::Key => self.key_path.as_ref().is_some_and(|p| !p.as_os_str().is_empty()),
            AuthKind::None => true,
        }
    }

    /// Fields of `other` win where present.
    pub fn overlay(&self, other: &Credentials) -> Credentials {
        Credentials {
            password: other.password.clone().or_else(|| self.password.clone()),
            key_path: other.key_path.clone().or_else(|| self.key_path.clone()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

fn default_port() -> u16 {
    22
}

/// Addressable remote endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub id: TargetId,
    /// Display name; used as the tab title.
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth: AuthKind,
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Replaces the transport's default remote-shell command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl ConnectionTarget {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        auth: AuthKind,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: TargetId::new(id),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth,
            credentials: Credentials::default(),
            command: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = self.credentials.overlay(&credentials);
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.satisfies(self.auth)
    }

    /// `user@host:port`, for notices and logs.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}

impl std::fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target not found: {0}")]
    NotFound(TargetId),
    #[error("duplicate target id: {0}")]
    Duplicate(TargetId),
    #[error("invalid target {0}: {1}")]
    Invalid(TargetId, String),
}

/// Read access to targets, plus opt-in credential write-back.
pub trait TargetStore: Send + Sync {
    fn get(&self, id: &TargetId) -> Option<ConnectionTarget>;

    /// Persist credentials supplied at a prompt. Only called when the user
    /// asked for them to be remembered.
    fn remember_credentials(&self, id: &TargetId, credentials: &Credentials) -> Result<(), TargetError>;
}

/// In-memory target table, usually loaded from config.
#[derive(Clone, Default)]
pub struct TargetBook {
    inner: Arc<RwLock<HashMap<TargetId, ConnectionTarget>>>,
}

impl TargetBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_targets(targets: impl IntoIterator<Item = ConnectionTarget>) -> Result<Self, TargetError> {
        let book = Self::new();
        for target in targets {
            book.insert(target)?;
        }
        Ok(book)
    }

    pub fn insert(&self, target: ConnectionTarget) -> Result<(), TargetError> {
        validate_target(&target)?;
        let mut inner = self.inner.write();
        if inner.contains_key(&target.id) {
            return Err(TargetError::Duplicate(target.id));
        }
        inner.insert(target.id.clone(), target);
        Ok(())
    }

    /// All targets sorted by id.
    pub fn list(&self) -> Vec<ConnectionTarget> {
        let mut targets: Vec<_> = self.inner.read().values().cloned().collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TargetStore for TargetBook {
    fn get(&self, id: &TargetId) -> Option<ConnectionTarget> {
        self.inner.read().get(id).cloned()
    }

    fn remember_credentials(&self, id: &TargetId, credentials: &Credentials) -> Result<(), TargetError> {
        let mut inner = self.inner.write();
        let target = inner
            .get_mut(id)
            .ok_or_else(|| TargetError::NotFound(id.clone()))?;
        target.credentials = target.credentials.overlay(credentials);
        Ok(())
    }
}

/// Reject targets that can never connect.
pub fn validate_target(target: &ConnectionTarget) -> Result<(), TargetError> {
    let invalid = |msg: &str| Err(TargetError::Invalid(target.id.clone(), msg.to_string()));
    if target.id.as_str().is_empty() {
        return invalid("id must not be empty");
    }
    if target.command.as_ref().is_some_and(|argv| argv.is_empty()) {
        return invalid("command must not be empty");
    }
    if target.command.is_none() {
        if target.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if target.port == 0 {
            return invalid("port must be non-zero");
        }
        if target.username.trim().is_empty() {
            return invalid("username must not be empty");
        }
    }
    Ok(())
}
