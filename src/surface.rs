//! Terminal surfaces: where a session's output is drawn and where its
//! keystrokes come from. Rendering itself belongs to the implementor.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::session::SessionId;
use crate::target::ConnectionTarget;

/// Capacity of a surface's input channel.
pub const SURFACE_INPUT_CAPACITY: usize = 256;

/// Something the user did on a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
}

pub trait TerminalSurface: Send + Sync {
    /// Append raw terminal bytes.
    fn write(&self, data: &[u8]);

    /// Apply a size decided by the engine.
    fn resize(&self, cols: u16, rows: u16);

    /// Release the surface. Idempotent.
    fn dispose(&self);

    /// Hand over the stream of user input and resize requests. Returns
    /// `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<SurfaceEvent>>;

    /// Current fitted size as `(cols, rows)`, if known.
    fn size(&self) -> Option<(u16, u16)> {
        None
    }
}

/// Opens one surface per new session.
pub trait SurfaceFactory: Send + Sync {
    fn open(&self, session_id: SessionId, target: &ConnectionTarget) -> Arc<dyn TerminalSurface>;
}

impl<F> SurfaceFactory for F
where
    F: Fn(SessionId, &ConnectionTarget) -> Arc<dyn TerminalSurface> + Send + Sync,
{
    fn open(&self, session_id: SessionId, target: &ConnectionTarget) -> Arc<dyn TerminalSurface> {
        self(session_id, target)
    }
}

/// Status lines the engine writes into a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connecting(String),
    Connected(String),
    CredentialsRequired(String),
    CredentialsCancelled,
    ConnectFailed(String),
    Closed(Option<String>),
    StreamError(String),
}

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

impl Notice {
    /// Colored, newline-terminated status line.
    pub fn render(&self) -> String {
        match self {
            Notice::Connecting(label) => format!("{YELLOW}Connecting to {label}...{RESET}\r\n"),
            Notice::Connected(label) => format!("{GREEN}Connected to {label}{RESET}\r\n"),
            Notice::CredentialsRequired(label) => {
                format!("{YELLOW}Credentials required for {label}{RESET}\r\n")
            }
            Notice::CredentialsCancelled => format!("{YELLOW}Credential prompt cancelled{RESET}\r\n"),
            Notice::ConnectFailed(err) => format!("\r\n{RED}Connection failed: {err}{RESET}\r\n"),
            Notice::Closed(None) => format!("\r\n{RED}Connection closed{RESET}\r\n"),
            Notice::Closed(Some(reason)) => format!("\r\n{RED}Connection closed: {reason}{RESET}\r\n"),
            Notice::StreamError(err) => format!("\r\n{RED}Error: {err}{RESET}\r\n"),
        }
    }

    pub fn write_to(&self, surface: &dyn TerminalSurface) {
        surface.write(self.render().as_bytes());
    }
}

/// Headless surface that keeps everything written to it.
///
/// Used for scripted fan-out runs, where output is collected and printed
/// once the session goes quiet.
pub struct BufferSurface {
    output: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    size: Mutex<Option<(u16, u16)>>,
    disposed: AtomicBool,
    input_tx: mpsc::Sender<SurfaceEvent>,
    input_rx: Mutex<Option<mpsc::Receiver<SurfaceEvent>>>,
}

impl BufferSurface {
    pub fn new() -> Arc<Self> {
        Self::with_size(None)
    }

    pub fn with_size(size: Option<(u16, u16)>) -> Arc<Self> {
        let (input_tx, input_rx) = mpsc::channel(SURFACE_INPUT_CAPACITY);
        Arc::new(Self {
            output: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            size: Mutex::new(size),
            disposed: AtomicBool::new(false),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
        })
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).into_owned()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    /// Number of `write` calls, including ones after disposal.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Simulate the user typing. Returns `false` once nobody listens.
    pub fn type_input(&self, text: &str) -> bool {
        self.input_tx
            .try_send(SurfaceEvent::Input(Bytes::copy_from_slice(text.as_bytes())))
            .is_ok()
    }

    /// Simulate the surface re-fitting to a new size.
    pub fn request_resize(&self, cols: u16, rows: u16) -> bool {
        *self.size.lock() = Some((cols, rows));
        self.input_tx.try_send(SurfaceEvent::Resize { cols, rows }).is_ok()
    }
}

impl TerminalSurface for BufferSurface {
    fn write(&self, data: &[u8]) {
        self.writes.fetch_add(1, Ordering::AcqRel);
        if self.is_disposed() {
            tracing::debug!("write to disposed surface ignored");
            return;
        }
        self.output.lock().extend_from_slice(data);
    }

    fn resize(&self, cols: u16, rows: u16) {
        *self.size.lock() = Some((cols, rows));
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SurfaceEvent>> {
        self.input_rx.lock().take()
    }

    fn size(&self) -> Option<(u16, u16)> {
        *self.size.lock()
    }
}

/// Factory that opens a [`BufferSurface`] per session and keeps a handle to
/// each so callers can read the captured output.
#[derive(Clone, Default)]
pub struct BufferSurfaces {
    surfaces: Arc<Mutex<HashMap<SessionId, Arc<BufferSurface>>>>,
    size: Option<(u16, u16)>,
}

impl BufferSurfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Surfaces report this size when opened.
    pub fn with_size(cols: u16, rows: u16) -> Self {
        Self {
            surfaces: Arc::default(),
            size: Some((cols, rows)),
        }
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<BufferSurface>> {
        self.surfaces.lock().get(&session_id).cloned()
    }
}

impl SurfaceFactory for BufferSurfaces {
    fn open(&self, session_id: SessionId, _target: &ConnectionTarget) -> Arc<dyn TerminalSurface> {
        let surface = BufferSurface::with_size(self.size);
        self.surfaces.lock().insert(session_id, surface.clone());
        surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_surface_records_writes() {
        let surface = BufferSurface::new();
        surface.write(b"hello ");
        surface.write(b"world");
        assert_eq!(surface.contents(), "hello world");
        assert_eq!(surface.write_count(), 2);
    }

    #[test]
    fn writes_after_dispose_are_counted_but_dropped() {
        let surface = BufferSurface::new();
        surface.write(b"a");
        surface.dispose();
        surface.dispose();
        surface.write(b"b");
        assert_eq!(surface.contents(), "a");
        assert_eq!(surface.write_count(), 2);
        assert!(surface.is_disposed());
    }

    #[tokio::test]
    async fn input_stream_is_taken_once() {
        let surface = BufferSurface::new();
        let mut rx = surface.take_events().unwrap();
        assert!(surface.take_events().is_none());

        assert!(surface.type_input("ls\r"));
        assert!(surface.request_resize(100, 30));
        assert_eq!(rx.recv().await, Some(SurfaceEvent::Input(Bytes::from_static(b"ls\r"))));
        assert_eq!(rx.recv().await, Some(SurfaceEvent::Resize { cols: 100, rows: 30 }));
        assert_eq!(surface.size(), Some((100, 30)));
    }

    #[test]
    fn notices_are_colored_lines() {
        let closed = Notice::Closed(None).render();
        assert!(closed.contains("\x1b[31mConnection closed"));
        assert!(closed.ends_with("\r\n"));

        let ok = Notice::Connected("root@h:22".into()).render();
        assert!(ok.starts_with("\x1b[32m"));
        assert!(ok.contains("root@h:22"));

        assert!(Notice::Closed(Some("eof".into())).render().contains("Connection closed: eof"));
    }
}
