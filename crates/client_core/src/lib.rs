use std::{sync::Arc, time::Duration};

use serde_json::{Map, Value};
use shared::{
    domain::{local_connection_id, ConnectionId, ExecutionMode, NodeId, NodeIdentity, SessionId},
    graph::{CanvasSnapshot, Connection, Position, ViewportState},
    protocol::{
        CodeExportRequest, CreateConnectionRequest, CreateNodeRequest, DebugStepResult,
        PatternRefactorRequest, PatternSearchRequest, PortsUpdate,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tracing::{debug, info, warn};

pub mod config;
pub mod debug;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod graph_store;
pub mod normalize;
pub mod persistence;
pub mod sync;
pub mod viewport;

pub use config::ClientSettings;
pub use dispatcher::{DispatchMessage, Dispatcher};
pub use error::{ClientError, GraphError, PersistenceError, SyncError};
pub use persistence::{SaveStatus, SnapshotStore};
pub use sync::SyncChannel;

use debug::DebugOrchestrator;
use execution::ExecutionVisualizer;
use graph_store::{GraphStore, NodePatch};
use persistence::{PersistenceState, UiSettings};
use viewport::{CanvasRect, ViewportController, ZOOM_STEP};

const FIT_PADDING: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    GraphChanged {
        revision: u64,
    },
    ViewportChanged(ViewportState),
    SaveStatusChanged(SaveStatus),
    Notification {
        level: NotificationLevel,
        message: String,
    },
    ParadigmChanged(String),
    ExecutionStateChanged {
        executing: bool,
        current_node: Option<NodeId>,
    },
    DebugSessionsChanged,
    PushChannelClosed {
        reason: String,
    },
}

/// Proof that the caller asked the user before wiping the canvas.
#[derive(Debug)]
pub struct ClearConfirmation {
    _acknowledged: (),
}

impl ClearConfirmation {
    pub fn acknowledge_data_loss() -> Self {
        Self { _acknowledged: () }
    }
}

/// Everything the dispatcher and the request methods mutate. Lives behind one mutex.
#[derive(Debug)]
pub struct CanvasState {
    pub graph: GraphStore,
    pub viewport: ViewportController,
    pub persistence: PersistenceState,
    pub visualizer: ExecutionVisualizer,
    pub debug: DebugOrchestrator,
    pub paradigm: Option<String>,
}

impl CanvasState {
    pub fn new(settings: &ClientSettings) -> Self {
        let mut visualizer = ExecutionVisualizer::new(
            settings.highlight_duration(),
            settings.data_flow_duration(),
            settings.event_log_capacity,
        );
        visualizer.set_execution_speed(settings.execution_speed);
        Self {
            graph: GraphStore::new(),
            viewport: ViewportController::new(),
            persistence: PersistenceState::new(
                settings.autosave_debounce(),
                settings.project_name.clone(),
            ),
            visualizer,
            debug: DebugOrchestrator::new(),
            paradigm: None,
        }
    }

    pub fn snapshot(&self) -> CanvasSnapshot {
        self.graph.snapshot_with(self.viewport.state())
    }

    pub(crate) fn apply_ui_settings(&mut self, ui: UiSettings) {
        self.visualizer.set_execution_speed(ui.execution_speed);
        self.visualizer
            .set_highlight_duration(Duration::from_millis(ui.highlight_duration_ms));
        self.persistence.ui = ui;
    }

    pub(crate) fn apply_debug_step(
        &mut self,
        session_id: &SessionId,
        result: &DebugStepResult,
        now: Instant,
    ) -> bool {
        if !self.debug.record_step(session_id, result) {
            return false;
        }
        if let Some(node_id) = &result.node_id {
            self.visualizer
                .highlight_debug_step(node_id, result.status, now);
        }
        true
    }

    pub(crate) fn remove_debug_session(&mut self, session_id: &SessionId) -> bool {
        let Some(session) = self.debug.remove(session_id) else {
            return false;
        };
        if let Some(node_id) = &session.current_node {
            self.visualizer.clear_node(node_id);
        }
        true
    }
}

pub struct CanvasClient {
    sync: Arc<dyn SyncChannel>,
    store: Arc<dyn SnapshotStore>,
    settings: ClientSettings,
    state: Mutex<CanvasState>,
    events: broadcast::Sender<ClientEvent>,
}

impl CanvasClient {
    pub fn new(
        sync: Arc<dyn SyncChannel>,
        store: Arc<dyn SnapshotStore>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            sync,
            store,
            state: Mutex::new(CanvasState::new(&settings)),
            settings,
            events,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Runs `f` against a consistent view of the state.
    pub async fn read<R>(&self, f: impl FnOnce(&CanvasState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn notify(&self, level: NotificationLevel, message: String) {
        debug!(?level, %message, "user notification");
        self.emit(ClientEvent::Notification { level, message });
    }

    /// Schedules an autosave unless a restore is replaying.
    pub(crate) fn mark_dirty(&self, state: &mut CanvasState) {
        if state.persistence.restoring {
            return;
        }
        state.persistence.autosave.schedule(Instant::now());
        self.set_save_status(&mut state.persistence, SaveStatus::Saving);
    }

    fn graph_changed(&self, state: &mut CanvasState) {
        self.mark_dirty(state);
        self.emit(ClientEvent::GraphChanged {
            revision: state.graph.revision(),
        });
    }

    fn rejected(&self, action: &str, err: &SyncError) {
        if !err.is_rejection() {
            warn!("{action} failed: {err}");
        }
        self.notify(
            NotificationLevel::Error,
            format!("Could not {action}: {err}"),
        );
    }

    async fn node_identity(&self, node_id: &NodeId) -> Result<NodeIdentity, ClientError> {
        self.state
            .lock()
            .await
            .graph
            .identity(node_id)
            .ok_or_else(|| ClientError::UnknownNode(node_id.clone()))
    }

    async fn commit_patch(&self, node_id: &NodeId, patch: NodePatch) {
        let mut state = self.state.lock().await;
        if state.graph.patch_node_fields(node_id, patch) {
            self.graph_changed(&mut state);
        }
    }

    /// Replaces local state with the backend's current canvas.
    pub async fn load_from_backend(&self) -> Result<(), ClientError> {
        let load = match self.sync.fetch_canvas().await {
            Ok(load) => load,
            Err(err) => {
                self.rejected("load the canvas", &err);
                return Err(err.into());
            }
        };

        let node_count = load.nodes.len();
        let connection_count = load.connections.len();
        let (revision, viewport) = {
            let mut state = self.state.lock().await;
            state.graph.replace_all(load.nodes, load.connections);
            state.viewport.apply(load.viewport);
            state.persistence.pending_clear_echoes = 0;
            (state.graph.revision(), state.viewport.state())
        };
        info!(
            nodes = node_count,
            connections = connection_count,
            "canvas loaded from backend"
        );
        self.emit(ClientEvent::GraphChanged { revision });
        self.emit(ClientEvent::ViewportChanged(viewport));
        Ok(())
    }

    /// The node shows up once the backend pushes `node_added`.
    pub async fn create_node(
        &self,
        node_type: impl Into<String>,
        position: Position,
    ) -> Result<NodeId, ClientError> {
        self.create_node_from(CreateNodeRequest::new(node_type, position))
            .await
    }

    pub async fn create_node_from(
        &self,
        request: CreateNodeRequest,
    ) -> Result<NodeId, ClientError> {
        match self.sync.create_node(&request).await {
            Ok(node_id) => {
                debug!(
                    %node_id,
                    node_type = %request.node_type,
                    "node creation accepted"
                );
                Ok(node_id)
            }
            Err(err) => {
                self.rejected("create node", &err);
                Err(err.into())
            }
        }
    }

    pub async fn move_node(&self, node_id: &NodeId, position: Position) -> Result<(), ClientError> {
        let identity = self.node_identity(node_id).await?;
        if !identity.is_local_fallback() {
            if let Err(err) = self.sync.move_node(node_id, position).await {
                self.rejected("move node", &err);
                return Err(err.into());
            }
        }
        self.commit_patch(node_id, NodePatch::position(position))
            .await;
        Ok(())
    }

    pub async fn delete_node(&self, node_id: &NodeId) -> Result<(), ClientError> {
        let identity = self.node_identity(node_id).await?;
        if !identity.is_local_fallback() {
            if let Err(err) = self.sync.delete_node(node_id).await {
                self.rejected("delete node", &err);
                return Err(err.into());
            }
        }

        let mut state = self.state.lock().await;
        if let Some(removed) = state.graph.remove_node(node_id) {
            debug!(
                %node_id,
                cascaded = removed.connections.len(),
                "node removed"
            );
            state.visualizer.clear_node(node_id);
            self.graph_changed(&mut state);
        }
        Ok(())
    }

    /// Shallow-merges `partial` into the node's parameters.
    pub async fn update_node_parameters(
        &self,
        node_id: &NodeId,
        partial: Map<String, Value>,
    ) -> Result<(), ClientError> {
        let identity = self.node_identity(node_id).await?;
        let merged = if identity.is_local_fallback() {
            let state = self.state.lock().await;
            match state.graph.node(node_id) {
                Some(node) => node.parameters.merged_with(&partial),
                None => return Err(ClientError::UnknownNode(node_id.clone())),
            }
        } else {
            match self.sync.update_node_parameters(node_id, &partial).await {
                Ok(merged) => merged,
                Err(err) => {
                    self.rejected("update node parameters", &err);
                    return Err(err.into());
                }
            }
        };
        self.commit_patch(node_id, NodePatch::parameters(merged))
            .await;
        Ok(())
    }

    pub async fn update_node_metadata(
        &self,
        node_id: &NodeId,
        partial: Map<String, Value>,
    ) -> Result<(), ClientError> {
        let identity = self.node_identity(node_id).await?;
        let merged = if identity.is_local_fallback() {
            let state = self.state.lock().await;
            match state.graph.node(node_id) {
                Some(node) => node.metadata.merged_with(&partial),
                None => return Err(ClientError::UnknownNode(node_id.clone())),
            }
        } else {
            match self.sync.update_node_metadata(node_id, &partial).await {
                Ok(merged) => merged,
                Err(err) => {
                    self.rejected("update node metadata", &err);
                    return Err(err.into());
                }
            }
        };
        self.commit_patch(node_id, NodePatch::metadata(merged))
            .await;
        Ok(())
    }

    pub async fn update_node_ports(
        &self,
        node_id: &NodeId,
        ports: PortsUpdate,
    ) -> Result<(), ClientError> {
        let identity = self.node_identity(node_id).await?;
        let ports = if identity.is_local_fallback() {
            ports
        } else {
            match self.sync.update_node_ports(node_id, &ports).await {
                Ok(accepted) => accepted,
                Err(err) => {
                    self.rejected("update node ports", &err);
                    return Err(err.into());
                }
            }
        };
        self.commit_patch(node_id, NodePatch::ports(ports.inputs, ports.outputs))
            .await;
        Ok(())
    }

    /// Connections touching a local-only node stay local; others appear on `connection_added`.
    pub async fn connect(
        &self,
        source: &NodeId,
        source_port: &str,
        target: &NodeId,
        target_port: &str,
    ) -> Result<ConnectionId, ClientError> {
        let candidate = Connection {
            id: local_connection_id(),
            source_node_id: source.clone(),
            source_port: source_port.to_string(),
            target_node_id: target.clone(),
            target_port: target_port.to_string(),
            data_type: None,
        };
        if candidate.is_self_loop() {
            return Err(GraphError::SelfLoop {
                connection_id: candidate.id,
                node_id: source.clone(),
            }
            .into());
        }

        let source_identity = self.node_identity(source).await?;
        let target_identity = self.node_identity(target).await?;
        if source_identity.is_local_fallback() || target_identity.is_local_fallback() {
            let connection_id = candidate.id.clone();
            let mut state = self.state.lock().await;
            state.graph.upsert_connection(candidate)?;
            state.graph.mark_local_connection(&connection_id);
            self.graph_changed(&mut state);
            return Ok(connection_id);
        }

        match self
            .sync
            .create_connection(&CreateConnectionRequest::from(&candidate))
            .await
        {
            Ok(connection_id) => {
                debug!(%connection_id, %source, %target, "connection accepted");
                Ok(connection_id)
            }
            Err(err) => {
                self.rejected("connect nodes", &err);
                Err(err.into())
            }
        }
    }

    pub async fn disconnect(&self, connection_id: &ConnectionId) -> Result<(), ClientError> {
        let local = {
            let state = self.state.lock().await;
            if state.graph.connection(connection_id).is_none() {
                return Err(ClientError::UnknownConnection(connection_id.clone()));
            }
            state.graph.is_local_connection(connection_id)
        };
        if !local {
            if let Err(err) = self.sync.delete_connection(connection_id).await {
                self.rejected("remove connection", &err);
                return Err(err.into());
            }
        }

        let mut state = self.state.lock().await;
        if state.graph.remove_connection(connection_id).is_some() {
            self.graph_changed(&mut state);
        }
        Ok(())
    }

    pub async fn clear_canvas(&self, _confirmation: ClearConfirmation) -> Result<(), ClientError> {
        if let Err(err) = self.sync.clear_canvas().await {
            self.rejected("clear the canvas", &err);
            return Err(err.into());
        }
        let mut state = self.state.lock().await;
        state.visualizer.reset();
        if state.graph.clear() {
            self.graph_changed(&mut state);
        }
        info!("canvas cleared");
        Ok(())
    }

    pub async fn set_surface_size(&self, width: f64, height: f64) {
        let mut state = self.state.lock().await;
        state.viewport.set_surface_size(width, height);
    }

    pub async fn viewport(&self) -> ViewportState {
        self.state.lock().await.viewport.state()
    }

    pub async fn set_zoom(&self, zoom: f64, anchor: Option<(f64, f64)>) -> bool {
        self.zoom_viewport(|_| zoom, anchor).await
    }

    pub async fn zoom_in(&self, anchor: Option<(f64, f64)>) -> bool {
        let anchor = match anchor {
            Some(anchor) => Some(anchor),
            None => self.state.lock().await.viewport.surface_center(),
        };
        self.zoom_viewport(|current| current * ZOOM_STEP, anchor)
            .await
    }

    pub async fn zoom_out(&self, anchor: Option<(f64, f64)>) -> bool {
        let anchor = match anchor {
            Some(anchor) => Some(anchor),
            None => self.state.lock().await.viewport.surface_center(),
        };
        self.zoom_viewport(|current| current / ZOOM_STEP, anchor)
            .await
    }

    /// Applies locally first; the backend copy is best-effort.
    async fn zoom_viewport(
        &self,
        target: impl FnOnce(f64) -> f64,
        anchor: Option<(f64, f64)>,
    ) -> bool {
        let (viewport, mirror_anchor) = {
            let mut state = self.state.lock().await;
            let pan = state.viewport.pan();
            let zoom = target(state.viewport.zoom());
            if !state.viewport.set_zoom(zoom, anchor) {
                return false;
            }
            self.mark_dirty(&mut state);
            // Zooming about the pan origin leaves pan where it is.
            (state.viewport.state(), anchor.unwrap_or(pan))
        };
        self.emit(ClientEvent::ViewportChanged(viewport));
        let zoom = viewport.zoom;
        if let Err(err) = self.sync.set_viewport_zoom(zoom, mirror_anchor).await {
            warn!("viewport zoom not mirrored to backend: {err}");
        }
        true
    }

    pub async fn pan_by(&self, dx: f64, dy: f64) -> bool {
        let viewport = {
            let mut state = self.state.lock().await;
            if !state.viewport.pan_by(dx, dy) {
                return false;
            }
            self.mark_dirty(&mut state);
            state.viewport.state()
        };
        self.emit(ClientEvent::ViewportChanged(viewport));
        if let Err(err) = self.sync.pan_viewport(dx, dy).await {
            warn!("viewport pan not mirrored to backend: {err}");
        }
        true
    }

    /// Frames every node in the surface. Needs a known surface size.
    pub async fn fit_to_content(&self) -> bool {
        let (before, after) = {
            let mut state = self.state.lock().await;
            let Some((min, max)) = state.graph.bounds() else {
                return false;
            };
            let before = state.viewport.state();
            if !state
                .viewport
                .fit_to_bounds(CanvasRect::new(min, max), FIT_PADDING)
            {
                return false;
            }
            self.mark_dirty(&mut state);
            (before, state.viewport.state())
        };
        self.emit(ClientEvent::ViewportChanged(after));

        if after.zoom != before.zoom {
            if let Err(err) = self
                .sync
                .set_viewport_zoom(after.zoom, (before.pan_x, before.pan_y))
                .await
            {
                warn!("viewport zoom not mirrored to backend: {err}");
                return true;
            }
        }
        let (dx, dy) = (after.pan_x - before.pan_x, after.pan_y - before.pan_y);
        if dx != 0.0 || dy != 0.0 {
            if let Err(err) = self.sync.pan_viewport(dx, dy).await {
                warn!("viewport pan not mirrored to backend: {err}");
            }
        }
        true
    }

    pub async fn set_active_paradigm(&self, paradigm: &str) -> Result<(), ClientError> {
        let active = match self.sync.set_active_paradigm(paradigm).await {
            Ok(active) => active.unwrap_or_else(|| paradigm.to_string()),
            Err(err) => {
                self.rejected("switch paradigm", &err);
                return Err(err.into());
            }
        };
        let changed = {
            let mut state = self.state.lock().await;
            let changed = state.paradigm.as_deref() != Some(active.as_str());
            state.paradigm = Some(active.clone());
            changed
        };
        if changed {
            self.emit(ClientEvent::ParadigmChanged(active));
        }
        Ok(())
    }

    pub async fn start_execution(&self, mode: ExecutionMode) -> Result<Value, ClientError> {
        match self.sync.start_execution(mode).await {
            Ok(response) => {
                info!(?mode, "execution started");
                Ok(response)
            }
            Err(err) => {
                self.rejected("start execution", &err);
                Err(err.into())
            }
        }
    }

    pub async fn step_execution(&self) -> Result<Value, ClientError> {
        self.sync.step_execution().await.map_err(|err| {
            self.rejected("step execution", &err);
            err.into()
        })
    }

    pub async fn stop_execution(&self) -> Result<Value, ClientError> {
        let response = match self.sync.stop_execution().await {
            Ok(response) => response,
            Err(err) => {
                self.rejected("stop execution", &err);
                return Err(err.into());
            }
        };
        self.state.lock().await.visualizer.reset();
        self.emit(ClientEvent::ExecutionStateChanged {
            executing: false,
            current_node: None,
        });
        Ok(response)
    }

    /// Searches the code of every node currently on the canvas.
    pub async fn pattern_search(
        &self,
        pattern: &str,
        language: &str,
    ) -> Result<Value, ClientError> {
        let nodes = self.state.lock().await.graph.nodes().cloned().collect();
        let request = PatternSearchRequest {
            pattern: pattern.to_string(),
            language: language.to_string(),
            nodes_data: Some(nodes),
        };
        self.sync.pattern_search(&request).await.map_err(|err| {
            self.rejected("search code", &err);
            err.into()
        })
    }

    /// An applied refactor comes back as `node_updated` pushes.
    pub async fn pattern_refactor(
        &self,
        request: PatternRefactorRequest,
    ) -> Result<Value, ClientError> {
        self.sync.pattern_refactor(&request).await.map_err(|err| {
            self.rejected("refactor code", &err);
            err.into()
        })
    }

    pub async fn export_code(
        &self,
        target_language: &str,
        options: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let (nodes, connections) = self.state.lock().await.graph.snapshot_parts();
        let request = CodeExportRequest {
            nodes,
            connections,
            target_language: target_language.to_string(),
            options,
        };
        self.sync.export_code(&request).await.map_err(|err| {
            self.rejected("export code", &err);
            err.into()
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
