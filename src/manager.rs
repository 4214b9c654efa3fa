//! The engine in one handle: registry, controller, bridge, input routing
//! and fan-out wired to one transport.

use std::sync::Arc;

use crate::bridge::OutputBridge;
use crate::config::EngineConfig;
use crate::controller::{ConnectOutcome, ConnectionController, ControllerError};
use crate::fanout::{Dispatch, FanoutExecutor, FanoutJob, SessionOpener};
use crate::input::InputRouter;
use crate::session::{RegistryError, SessionId, SessionRegistry};
use crate::surface::SurfaceFactory;
use crate::target::{Credentials, TargetId, TargetStore};
use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("target not found: {0}")]
    TargetNotFound(TargetId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct ManagerInner {
    registry: SessionRegistry,
    targets: Arc<dyn TargetStore>,
    surfaces: Arc<dyn SurfaceFactory>,
    bridge: OutputBridge,
    input: InputRouter,
    controller: ConnectionController,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Wire up the engine. Must be called inside a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        targets: Arc<dyn TargetStore>,
        surfaces: Arc<dyn SurfaceFactory>,
        config: EngineConfig,
    ) -> Self {
        let registry = SessionRegistry::with_max_sessions(config.max_sessions());
        let bridge = OutputBridge::new(registry.clone(), transport.clone(), config.bridge());
        let input = InputRouter::new(registry.clone(), transport.clone());
        let controller = ConnectionController::new(
            registry.clone(),
            transport,
            targets.clone(),
            bridge.clone(),
            input.clone(),
            config.settle_delay(),
        );
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                targets,
                surfaces,
                bridge,
                input,
                controller,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn bridge(&self) -> &OutputBridge {
        &self.inner.bridge
    }

    pub fn input(&self) -> &InputRouter {
        &self.inner.input
    }

    pub fn controller(&self) -> &ConnectionController {
        &self.inner.controller
    }

    /// Create an idle session for `target_id` with a fresh surface. Nothing
    /// connects until [`SessionManager::on_session_created`].
    pub fn open(&self, target_id: &TargetId, initial_payload: Option<String>) -> Result<SessionId, ManagerError> {
        let target = self
            .inner
            .targets
            .get(target_id)
            .ok_or_else(|| ManagerError::TargetNotFound(target_id.clone()))?;
        let surfaces = &self.inner.surfaces;
        let id = self.inner.registry.create(
            target.id.clone(),
            target.display_name().to_string(),
            initial_payload,
            |id| surfaces.open(id, &target),
        )?;
        Ok(id)
    }

    /// The session's surface is mounted: route its input and start
    /// connecting.
    pub fn on_session_created(&self, id: SessionId) -> ConnectOutcome {
        if let Err(e) = self.inner.input.attach(id) {
            tracing::warn!(session = %id, error = %e, "input route unavailable");
        }
        self.inner.controller.connect(id)
    }

    /// [`open`](Self::open) followed by [`on_session_created`](Self::on_session_created).
    pub fn open_and_connect(
        &self,
        target_id: &TargetId,
        initial_payload: Option<String>,
    ) -> Result<SessionId, ManagerError> {
        let id = self.open(target_id, initial_payload)?;
        self.on_session_created(id);
        Ok(id)
    }

    /// Reconnect a disconnected session.
    pub fn connect(&self, id: SessionId) -> ConnectOutcome {
        self.inner.controller.connect(id)
    }

    pub fn supply_credentials(
        &self,
        id: SessionId,
        credentials: Credentials,
        remember: bool,
    ) -> Result<ConnectOutcome, ControllerError> {
        self.inner.controller.supply_credentials(id, credentials, remember)
    }

    pub fn cancel_credentials(&self, id: SessionId) -> bool {
        self.inner.controller.cancel_credentials(id)
    }

    pub async fn disconnect(&self, id: SessionId) -> bool {
        self.inner.controller.disconnect(id).await
    }

    /// The session's view was closed by the user.
    pub async fn on_view_closed(&self, id: SessionId) -> bool {
        self.inner.controller.close(id).await
    }

    pub fn focus(&self, id: SessionId) -> Result<(), RegistryError> {
        self.inner.registry.focus(id)
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.inner.bridge.set_foreground(foreground);
    }

    /// Run `job` on every target it names.
    pub async fn run_script(&self, job: FanoutJob) -> Vec<Dispatch> {
        FanoutExecutor::new(&self.inner.registry, &self.inner.input, self)
            .execute(job)
            .await
    }

    /// Close every session and stop background tasks.
    pub async fn shutdown(&self) {
        for session in self.inner.registry.list() {
            self.inner.controller.close(session.id).await;
        }
        self.inner.bridge.shutdown();
        tracing::debug!("session manager shut down");
    }
}

impl SessionOpener for SessionManager {
    fn open_session(&self, target_id: &TargetId, initial_payload: Option<String>) -> Result<SessionId, ManagerError> {
        self.open_and_connect(target_id, initial_payload)
    }
}
