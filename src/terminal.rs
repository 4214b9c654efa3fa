use bytes::Bytes;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use crate::surface::{SurfaceEvent, TerminalSurface, SURFACE_INPUT_CAPACITY};

/// Ctrl-]: leave the session.
pub const DETACH_BYTE: u8 = 0x1d;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("terminal io error: {0}")]
    Io(#[from] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// Raw mode passes every keystroke (Ctrl-C included) to the remote shell.
/// Dropping the guard restores the terminal, even on panic.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current terminal size as `(cols, rows)`.
pub fn terminal_size() -> Result<(u16, u16), TerminalError> {
    Ok(size()?)
}

/// Split a stdin chunk at the detach key. Returns the bytes before it and
/// whether the key was present.
pub fn split_detach(chunk: &[u8]) -> (&[u8], bool) {
    match chunk.iter().position(|&b| b == DETACH_BYTE) {
        Some(pos) => (&chunk[..pos], true),
        None => (chunk, false),
    }
}

/// The local terminal as a session surface.
///
/// Output goes straight to stdout. Keystrokes and window resizes are read
/// once [`StdoutSurface::start_input`] is called; `Ctrl-]` stops reading and
/// wakes [`StdoutSurface::detached`].
pub struct StdoutSurface {
    input_tx: mpsc::Sender<SurfaceEvent>,
    input_rx: Mutex<Option<mpsc::Receiver<SurfaceEvent>>>,
    disposed: AtomicBool,
    started: AtomicBool,
    detach: Notify,
}

impl StdoutSurface {
    pub fn new() -> Arc<Self> {
        let (input_tx, input_rx) = mpsc::channel(SURFACE_INPUT_CAPACITY);
        Arc::new(Self {
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            disposed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            detach: Notify::new(),
        })
    }

    /// Start reading stdin and watching for window size changes. Only the
    /// first call has an effect.
    pub fn start_input(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let surface = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 4096];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let (data, detach) = split_detach(&buf[..n]);
                        if !data.is_empty()
                            && surface
                                .input_tx
                                .blocking_send(SurfaceEvent::Input(Bytes::copy_from_slice(data)))
                                .is_err()
                        {
                            break;
                        }
                        if detach {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            surface.detach.notify_one();
        });

        #[cfg(unix)]
        {
            let tx = self.input_tx.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let Ok(mut sigwinch) = signal(SignalKind::window_change()) else {
                    return;
                };
                while sigwinch.recv().await.is_some() {
                    if let Ok((cols, rows)) = terminal_size() {
                        if tx.send(SurfaceEvent::Resize { cols, rows }).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    }

    /// Resolves when the user pressed the detach key or stdin closed.
    pub async fn detached(&self) {
        self.detach.notified().await;
    }
}

impl TerminalSurface for StdoutSurface {
    fn write(&self, data: &[u8]) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(data).and_then(|_| stdout.flush()) {
            tracing::debug!(error = %e, "stdout write failed");
        }
    }

    fn resize(&self, _cols: u16, _rows: u16) {}

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SurfaceEvent>> {
        self.input_rx.lock().take()
    }

    fn size(&self) -> Option<(u16, u16)> {
        terminal_size().ok()
    }
}

/// Read a secret from the terminal without echo. Returns `None` if the user
/// pressed Esc or Ctrl-C.
pub fn prompt_secret(prompt: &str) -> Result<Option<String>, TerminalError> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;

    let secret = {
        let _raw = RawModeGuard::new()?;
        let mut secret = String::new();
        loop {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match key.code {
                KeyCode::Enter => break Some(secret),
                KeyCode::Esc => break None,
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break None,
                KeyCode::Backspace => {
                    secret.pop();
                }
                KeyCode::Char(c) => secret.push(c),
                _ => {}
            }
        }
    };

    writeln!(stderr)?;
    Ok(secret)
}
