//! Local snapshot persistence, restore replay and project import/export.

use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::{local_connection_id, NodeId, NodeIdentity},
    graph::{CanvasSnapshot, Connection, ExportDocument, ProjectMeta},
    protocol::{CreateConnectionRequest, CreateNodeRequest},
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, PersistenceError},
    normalize, CanvasClient, ClientEvent, NotificationLevel,
};

pub mod store;

pub use store::{MemorySnapshotStore, SnapshotStore, StoredDocument};

pub const CANVAS_STATE_KEY: &str = "canvas_state";
pub const PROJECT_META_KEY: &str = "project_meta";
pub const UI_SETTINGS_KEY: &str = "ui_settings";
pub const CANVAS_STATE_VERSION: u32 = 1;
pub const PROJECT_META_VERSION: u32 = 1;
pub const UI_SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveStatus {
    #[default]
    Idle,
    Saving,
    Saved,
    Failed,
}

impl SaveStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "",
            Self::Saving => "Saving...",
            Self::Saved => "Saved",
            Self::Failed => "Save failed",
        }
    }
}

/// Trailing-edge debounce: every `schedule` pushes the deadline out again.
#[derive(Debug, Clone)]
pub struct AutosaveScheduler {
    debounce: Duration,
    due_at: Option<Instant>,
}

impl AutosaveScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            due_at: None,
        }
    }

    pub fn schedule(&mut self, now: Instant) {
        self.due_at = Some(now + self.debounce);
    }

    pub fn cancel(&mut self) {
        self.due_at = None;
    }

    pub fn is_pending(&self) -> bool {
        self.due_at.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.due_at
    }

    /// Consumes the pending save if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.due_at {
            Some(due_at) if due_at <= now => {
                self.due_at = None;
                true
            }
            _ => false,
        }
    }
}

fn default_grid_size() -> u32 {
    20
}

fn default_highlight_ms() -> u64 {
    1500
}

fn default_speed() -> f64 {
    1.0
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiSettings {
    #[serde(default = "enabled")]
    pub show_grid: bool,
    #[serde(default)]
    pub snap_to_grid: bool,
    #[serde(default = "default_grid_size")]
    pub grid_size: u32,
    #[serde(default = "enabled")]
    pub show_data_flow: bool,
    #[serde(default = "enabled")]
    pub animate_data_flow: bool,
    #[serde(default = "default_highlight_ms")]
    pub highlight_duration_ms: u64,
    #[serde(default = "default_speed")]
    pub execution_speed: f64,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            show_grid: true,
            snap_to_grid: false,
            grid_size: default_grid_size(),
            show_data_flow: true,
            animate_data_flow: true,
            highlight_duration_ms: default_highlight_ms(),
            execution_speed: default_speed(),
        }
    }
}

#[derive(Debug)]
pub struct PersistenceState {
    pub autosave: AutosaveScheduler,
    pub status: SaveStatus,
    /// Set while a restore replays; suppresses autosave scheduling.
    pub restoring: bool,
    /// `canvas_cleared` pushes still owed for remote clears a restore issued.
    pub pending_clear_echoes: u32,
    pub project_name: String,
    pub engine_tabs: Vec<Value>,
    pub ui: UiSettings,
}

impl PersistenceState {
    pub fn new(debounce: Duration, project_name: impl Into<String>) -> Self {
        Self {
            autosave: AutosaveScheduler::new(debounce),
            status: SaveStatus::Idle,
            restoring: false,
            pending_clear_echoes: 0,
            project_name: project_name.into(),
            engine_tabs: Vec::new(),
            ui: UiSettings::default(),
        }
    }
}

/// Counts from one restore replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub nodes_replayed: usize,
    pub nodes_local: usize,
    pub connections_replayed: usize,
    pub connections_local: usize,
    pub connections_skipped: usize,
    pub remote_cleared: bool,
    pub saved: bool,
}

impl RestoreReport {
    pub fn is_degraded(&self) -> bool {
        self.nodes_local > 0 || self.connections_local > 0 || self.connections_skipped > 0
    }
}

/// Reads `key` and drops it when its version is not `expected`.
pub async fn load_versioned(
    store: &dyn SnapshotStore,
    key: &str,
    expected: u32,
) -> Result<Option<StoredDocument>, PersistenceError> {
    let Some(document) = store
        .load_document(key)
        .await
        .map_err(PersistenceError::Store)?
    else {
        return Ok(None);
    };
    if document.version != expected {
        warn!(
            key,
            found = document.version,
            expected,
            "ignoring stored document with unexpected version"
        );
        return Ok(None);
    }
    Ok(Some(document))
}

pub async fn load_snapshot(
    store: &dyn SnapshotStore,
) -> Result<Option<CanvasSnapshot>, PersistenceError> {
    let Some(document) = load_versioned(store, CANVAS_STATE_KEY, CANVAS_STATE_VERSION).await? else {
        return Ok(None);
    };
    let snapshot = match serde_json::from_value::<CanvasSnapshot>(document.body.clone()) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            debug!("canonical snapshot decode failed, normalizing: {err}");
            match document.body {
                Value::Object(state) => normalize::normalize_snapshot(&state),
                _ => return Err(PersistenceError::Decode(err)),
            }
        }
    };
    Ok(Some(snapshot))
}

pub async fn load_project_meta(
    store: &dyn SnapshotStore,
) -> Result<Option<ProjectMeta>, PersistenceError> {
    let Some(document) = load_versioned(store, PROJECT_META_KEY, PROJECT_META_VERSION).await? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_value(document.body)?))
}

pub async fn store_snapshot(
    store: &dyn SnapshotStore,
    snapshot: &CanvasSnapshot,
    project: &ProjectMeta,
) -> Result<(), PersistenceError> {
    store
        .save_document(
            CANVAS_STATE_KEY,
            &StoredDocument {
                version: CANVAS_STATE_VERSION,
                saved_at: project.saved_at,
                body: serde_json::to_value(snapshot)?,
            },
        )
        .await
        .map_err(PersistenceError::Store)?;
    store
        .save_document(
            PROJECT_META_KEY,
            &StoredDocument {
                version: PROJECT_META_VERSION,
                saved_at: project.saved_at,
                body: serde_json::to_value(project)?,
            },
        )
        .await
        .map_err(PersistenceError::Store)
}

/// Deletes every local document. Returns the keys that existed.
pub async fn reset_documents(
    store: &dyn SnapshotStore,
) -> Result<Vec<&'static str>, PersistenceError> {
    let mut removed = Vec::new();
    for key in [CANVAS_STATE_KEY, PROJECT_META_KEY, UI_SETTINGS_KEY] {
        let deleted = store.delete_document(key).await;
        if deleted.map_err(PersistenceError::Store)? {
            removed.push(key);
        }
    }
    Ok(removed)
}

impl CanvasClient {
    /// Writes the current snapshot immediately, cancelling any pending autosave.
    pub async fn save_now(&self) -> Result<(), ClientError> {
        let (snapshot, project) = {
            let mut state = self.state.lock().await;
            state.persistence.autosave.cancel();
            self.set_save_status(&mut state.persistence, SaveStatus::Saving);
            (
                state.snapshot(),
                ProjectMeta {
                    name: state.persistence.project_name.clone(),
                    saved_at: Utc::now(),
                },
            )
        };

        let result = store_snapshot(self.store.as_ref(), &snapshot, &project).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                debug!(
                    nodes = snapshot.nodes.len(),
                    connections = snapshot.connections.len(),
                    "canvas snapshot saved"
                );
                self.set_save_status(&mut state.persistence, SaveStatus::Saved);
                Ok(())
            }
            Err(err) => {
                warn!("failed to save canvas snapshot: {err}");
                self.set_save_status(&mut state.persistence, SaveStatus::Failed);
                Err(err.into())
            }
        }
    }

    pub async fn save_status(&self) -> SaveStatus {
        self.state.lock().await.persistence.status
    }

    /// Replays the locally saved snapshot, if any, against the backend.
    pub async fn restore_saved_canvas(&self) -> Result<Option<RestoreReport>, ClientError> {
        let store = self.store.as_ref();
        if let Some(project) = load_project_meta(store).await? {
            self.state.lock().await.persistence.project_name = project.name;
        }
        let Some(snapshot) = load_snapshot(store).await? else {
            debug!("no saved canvas to restore");
            return Ok(None);
        };
        if snapshot.is_empty() {
            debug!("saved canvas is empty; keeping backend state");
            return Ok(None);
        }
        Ok(Some(self.restore_snapshot(snapshot).await))
    }

    /// Owed `canvas_cleared` echoes die with the push channel that would carry them.
    pub(crate) async fn forget_clear_echoes(&self) {
        self.state.lock().await.persistence.pending_clear_echoes = 0;
    }

    /// Clears both sides and replays `snapshot` node by node. Per-item failures
    /// degrade to local-only copies instead of aborting.
    pub async fn restore_snapshot(&self, snapshot: CanvasSnapshot) -> RestoreReport {
        let mut report = RestoreReport::default();
        {
            let mut state = self.state.lock().await;
            state.persistence.restoring = true;
            state.persistence.autosave.cancel();
        }

        match self.sync.clear_canvas().await {
            Ok(()) => {
                report.remote_cleared = true;
                self.state.lock().await.persistence.pending_clear_echoes += 1;
            }
            Err(err) => warn!("could not clear backend canvas before restore: {err}"),
        }

        {
            let mut state = self.state.lock().await;
            state.graph.clear();
            state.visualizer.reset();
        }

        let mut remap: HashMap<NodeId, NodeId> = HashMap::with_capacity(snapshot.nodes.len());
        for node in snapshot.nodes {
            let saved_id = node.id.clone();
            let request = CreateNodeRequest::from_node(&node);
            let identity = match self.sync.create_node(&request).await {
                Ok(assigned) => {
                    report.nodes_replayed += 1;
                    NodeIdentity::Remote(assigned)
                }
                Err(err) => {
                    warn!(
                        node_id = %saved_id,
                        "node replay failed, keeping a local copy: {err}"
                    );
                    report.nodes_local += 1;
                    NodeIdentity::local_fallback()
                }
            };

            let mut replayed = node;
            replayed.id = identity.id().clone();
            let mut state = self.state.lock().await;
            state.graph.upsert_node(replayed);
            if identity.is_local_fallback() {
                state.graph.mark_local_fallback(identity.id());
            }
            remap.insert(saved_id, identity.into_id());
        }

        for connection in snapshot.connections {
            let (Some(source), Some(target)) = (
                remap.get(&connection.source_node_id).cloned(),
                remap.get(&connection.target_node_id).cloned(),
            ) else {
                debug!(
                    connection_id = %connection.id,
                    "skipping connection with unknown endpoint"
                );
                report.connections_skipped += 1;
                continue;
            };
            if source == target {
                report.connections_skipped += 1;
                continue;
            }

            let touches_local = {
                let state = self.state.lock().await;
                state.graph.is_local_fallback(&source) || state.graph.is_local_fallback(&target)
            };
            let mut replayed = Connection {
                id: connection.id.clone(),
                source_node_id: source,
                source_port: connection.source_port,
                target_node_id: target,
                target_port: connection.target_port,
                data_type: connection.data_type,
            };

            let remote_id = if touches_local {
                None
            } else {
                match self
                    .sync
                    .create_connection(&CreateConnectionRequest::from(&replayed))
                    .await
                {
                    Ok(assigned) => Some(assigned),
                    Err(err) => {
                        warn!(
                            connection_id = %connection.id,
                            "keeping connection local: {err}"
                        );
                        None
                    }
                }
            };

            let mut state = self.state.lock().await;
            match remote_id {
                Some(assigned) => {
                    replayed.id = assigned;
                    report.connections_replayed += 1;
                }
                None => {
                    replayed.id = local_connection_id();
                    state.graph.mark_local_connection(&replayed.id);
                    report.connections_local += 1;
                }
            }
            if let Err(err) = state.graph.upsert_connection(replayed) {
                debug!("dropping replayed connection: {err}");
            }
        }

        let (revision, viewport) = {
            let mut state = self.state.lock().await;
            state.viewport.apply(snapshot.viewport);
            state.persistence.restoring = false;
            (state.graph.revision(), state.viewport.state())
        };
        self.emit(ClientEvent::GraphChanged { revision });
        self.emit(ClientEvent::ViewportChanged(viewport));

        report.saved = self.save_now().await.is_ok();
        info!(?report, "canvas restore finished");
        if report.is_degraded() {
            self.notify(
                NotificationLevel::Warning,
                format!(
                    "Restored with {} local-only node(s), {} local-only connection(s), {} skipped",
                    report.nodes_local, report.connections_local, report.connections_skipped
                ),
            );
        }
        report
    }

    pub async fn export_document(&self) -> ExportDocument {
        let state = self.state.lock().await;
        ExportDocument {
            project: ProjectMeta {
                name: state.persistence.project_name.clone(),
                saved_at: Utc::now(),
            },
            state: state.snapshot(),
            engine_tabs: state.persistence.engine_tabs.clone(),
        }
    }

    pub async fn export_json(&self) -> Result<String, ClientError> {
        let document = self.export_document().await;
        Ok(serde_json::to_string_pretty(&document).map_err(PersistenceError::from)?)
    }

    /// Normalizes a foreign project file and restores it.
    pub async fn import_document(&self, raw: &str) -> Result<RestoreReport, ClientError> {
        let value: Value = serde_json::from_str(raw).map_err(PersistenceError::from)?;
        let imported = normalize::normalize_import(value)?;
        {
            let mut state = self.state.lock().await;
            if let Some(name) = imported.project_name {
                state.persistence.project_name = name;
            }
            state.persistence.engine_tabs = imported.engine_tabs;
        }
        Ok(self.restore_snapshot(imported.snapshot).await)
    }

    pub async fn ui_settings(&self) -> UiSettings {
        self.state.lock().await.persistence.ui.clone()
    }

    pub async fn load_ui_settings(&self) -> Result<UiSettings, ClientError> {
        let store = self.store.as_ref();
        let loaded = match load_versioned(store, UI_SETTINGS_KEY, UI_SETTINGS_VERSION).await? {
            Some(document) => {
                serde_json::from_value(document.body).map_err(PersistenceError::from)?
            }
            None => UiSettings {
                highlight_duration_ms: self.settings.highlight_duration_ms,
                execution_speed: self.settings.execution_speed,
                ..UiSettings::default()
            },
        };
        self.state.lock().await.apply_ui_settings(loaded.clone());
        Ok(loaded)
    }

    pub async fn save_ui_settings(&self, settings: UiSettings) -> Result<(), ClientError> {
        let document = StoredDocument {
            version: UI_SETTINGS_VERSION,
            saved_at: Utc::now(),
            body: serde_json::to_value(&settings).map_err(PersistenceError::from)?,
        };
        self.store
            .save_document(UI_SETTINGS_KEY, &document)
            .await
            .map_err(PersistenceError::Store)?;
        self.state.lock().await.apply_ui_settings(settings);
        Ok(())
    }

    pub(crate) fn set_save_status(&self, persistence: &mut PersistenceState, status: SaveStatus) {
        if persistence.status != status {
            persistence.status = status;
            self.emit(ClientEvent::SaveStatusChanged(status));
        }
    }
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
