//! [`Transport`] backed by local pseudo-terminals.
//!
//! Each session runs the configured remote-shell client (`ssh` by default)
//! or the target's own command line inside a PTY. Output is read on a
//! blocking thread and either published as push events or buffered for
//! [`Transport::fetch`], depending on the configured delivery mode.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::events::EventHub;
use crate::session::SessionId;
use crate::target::{AuthKind, ConnectionTarget};
use crate::transport::{DeliveryMode, Transport, TransportError, TransportEvent};

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;
const READ_BUF_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// One running PTY child.
struct PtyConnection {
    generation: u64,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Poll mode: output not yet fetched.
    pending: Mutex<BytesMut>,
    /// Poll mode: set when the reader hit end of stream.
    eof: Mutex<Option<Option<String>>>,
}

impl PtyConnection {
    fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}

struct PtyInner {
    config: TransportConfig,
    hub: EventHub,
    connections: Mutex<HashMap<SessionId, Arc<PtyConnection>>>,
    next_generation: AtomicU64,
}

impl PtyInner {
    fn current(&self, id: SessionId) -> Option<Arc<PtyConnection>> {
        self.connections.lock().get(&id).cloned()
    }

    fn is_current(&self, id: SessionId, generation: u64) -> bool {
        self.connections
            .lock()
            .get(&id)
            .is_some_and(|c| c.generation == generation)
    }
}

#[derive(Clone)]
pub struct PtyTransport {
    inner: Arc<PtyInner>,
}

impl PtyTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(PtyInner {
                config,
                hub: EventHub::new(),
                connections: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }
}

/// Command line for `target`: its own command if it has one, otherwise the
/// configured client with port, key and destination.
pub fn build_argv(target: &ConnectionTarget, config: &TransportConfig) -> Vec<String> {
    if let Some(argv) = target.command.as_ref().filter(|argv| !argv.is_empty()) {
        return argv.clone();
    }
    let mut argv = vec![config.program.clone()];
    argv.extend(config.extra_args.iter().cloned());
    argv.push("-tt".to_string());
    argv.push("-p".to_string());
    argv.push(target.port.to_string());
    match target.auth {
        AuthKind::Key => {
            if let Some(key) = &target.credentials.key_path {
                argv.push("-i".to_string());
                argv.push(key.display().to_string());
            }
        }
        AuthKind::Password => {
            argv.push("-o".to_string());
            argv.push("PreferredAuthentications=keyboard-interactive,password".to_string());
        }
        AuthKind::None => {}
    }
    argv.push(format!("{}@{}", target.username, target.host));
    argv
}

/// Whether a chunk of output ends with a password prompt.
pub fn is_password_prompt(chunk: &[u8]) -> bool {
    let text = String::from_utf8_lossy(chunk).to_ascii_lowercase();
    let text = text.trim_end();
    text.ends_with("password:") || text.ends_with("passphrase:")
}

struct Spawned {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

fn spawn_pty(argv: &[String]) -> Result<Spawned, PtyError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(PtyError::OpenPty)?;

    let mut cmd = CommandBuilder::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env("TERM", std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()));

    let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
    // Only the child may hold the slave, or reads never see end of stream.
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
    let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;
    Ok(Spawned {
        master: pair.master,
        reader,
        writer,
        child,
    })
}

#[async_trait]
impl Transport for PtyTransport {
    fn delivery_mode(&self) -> DeliveryMode {
        self.inner.config.delivery
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        match self.inner.config.delivery {
            DeliveryMode::Push => self.inner.hub.take(),
            DeliveryMode::Poll => None,
        }
    }

    async fn connect(&self, target: &ConnectionTarget, session_id: SessionId) -> Result<(), TransportError> {
        if self.inner.connections.lock().contains_key(&session_id) {
            return Err(TransportError::AlreadyConnected(session_id));
        }

        let argv = build_argv(target, &self.inner.config);
        let label = target.label();
        tracing::debug!(session = %session_id, program = %argv[0], "spawning pty");
        let spawned = tokio::task::spawn_blocking(move || spawn_pty(&argv))
            .await
            .map_err(|e| TransportError::ConnectFailed {
                target: label.clone(),
                reason: e.to_string(),
            })?
            .map_err(|e| TransportError::ConnectFailed {
                target: label.clone(),
                reason: e.to_string(),
            })?;

        let Spawned {
            master,
            reader,
            writer,
            mut child,
        } = spawned;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(PtyConnection {
            generation,
            master: Mutex::new(master),
            writer: Mutex::new(writer),
            killer: Mutex::new(child.clone_killer()),
            pending: Mutex::new(BytesMut::new()),
            eof: Mutex::new(None),
        });

        {
            let mut connections = self.inner.connections.lock();
            if connections.contains_key(&session_id) {
                drop(connections);
                let _ = conn.killer.lock().kill();
                return Err(TransportError::AlreadyConnected(session_id));
            }
            connections.insert(session_id, conn.clone());
        }

        tokio::task::spawn_blocking(move || match child.wait() {
            Ok(status) => tracing::debug!(session = %session_id, ?status, "pty child exited"),
            Err(e) => tracing::error!(session = %session_id, error = %e, "error waiting for pty child"),
        });

        let password = match target.auth {
            AuthKind::Password => target.credentials.password.clone(),
            _ => None,
        };
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || read_loop(inner, session_id, conn, reader, password));

        tracing::info!(session = %session_id, target = %target.id, "pty connected");
        Ok(())
    }

    async fn send(&self, session_id: SessionId, data: Bytes) -> Result<(), TransportError> {
        let conn = self
            .inner
            .current(session_id)
            .ok_or(TransportError::NotConnected(session_id))?;
        tokio::task::spawn_blocking(move || conn.write(&data))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))?
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn resize(&self, session_id: SessionId, cols: u16, rows: u16) {
        if let Some(conn) = self.inner.current(session_id) {
            if let Err(e) = conn.resize(cols, rows) {
                tracing::warn!(session = %session_id, error = %e, "pty resize failed");
            }
        }
    }

    async fn disconnect(&self, session_id: SessionId) {
        let Some(conn) = self.inner.connections.lock().remove(&session_id) else {
            return;
        };
        if let Err(e) = conn.killer.lock().kill() {
            tracing::debug!(session = %session_id, error = %e, "pty child already gone");
        }
        tracing::debug!(session = %session_id, "pty disconnected");
    }

    async fn fetch(&self, session_id: SessionId) -> Result<Option<Bytes>, TransportError> {
        let conn = self
            .inner
            .current(session_id)
            .ok_or(TransportError::NotConnected(session_id))?;
        // Read the end marker first: once it is set, all output is pending.
        let eof = conn.eof.lock().clone();
        {
            let mut pending = conn.pending.lock();
            if !pending.is_empty() {
                return Ok(Some(pending.split().freeze()));
            }
        }
        match eof {
            Some(reason) => {
                let mut connections = self.inner.connections.lock();
                if connections.get(&session_id).is_some_and(|c| c.generation == conn.generation) {
                    connections.remove(&session_id);
                }
                Err(TransportError::Closed(reason))
            }
            None => Ok(None),
        }
    }
}

fn read_loop(
    inner: Arc<PtyInner>,
    session_id: SessionId,
    conn: Arc<PtyConnection>,
    mut reader: Box<dyn Read + Send>,
    mut password: Option<String>,
) {
    let mode = inner.config.delivery;
    let mut buf = [0u8; READ_BUF_SIZE];
    let reason = loop {
        match reader.read(&mut buf) {
            Ok(0) => break None,
            Ok(n) => {
                let chunk = &buf[..n];
                if password.is_some() && is_password_prompt(chunk) {
                    if let Some(pw) = password.take() {
                        if let Err(e) = conn.write(format!("{pw}\n").as_bytes()) {
                            tracing::warn!(session = %session_id, error = %e, "failed to answer password prompt");
                        }
                    }
                }
                match mode {
                    DeliveryMode::Push => inner.hub.publish_blocking(TransportEvent::Output {
                        session_id,
                        data: Bytes::copy_from_slice(chunk),
                    }),
                    DeliveryMode::Poll => conn.pending.lock().extend_from_slice(chunk),
                }
            }
            // EIO is how Linux reports the slave side closing.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break None,
            Err(e) => break Some(e.to_string()),
        }
    };

    if !inner.is_current(session_id, conn.generation) {
        tracing::trace!(session = %session_id, "reader for replaced connection finished");
        return;
    }
    tracing::debug!(session = %session_id, ?reason, "pty stream ended");
    match mode {
        DeliveryMode::Push => {
            inner.connections.lock().remove(&session_id);
            inner.hub.publish_blocking(TransportEvent::Closed { session_id, reason });
        }
        DeliveryMode::Poll => *conn.eof.lock() = Some(reason),
    }
}
