//! Multi-session debugging.
//!
//! Sessions share one variable namespace on purpose: the backend runs every session
//! inside one interpreter, so a binding written by any step is what every session sees
//! next.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use shared::{
    domain::{DebugSessionState, NodeId, SessionId, StepType},
    error::ErrorCode,
    protocol::{
        CreateDebugSessionRequest, DebugNodeSpec, DebugSessionList, DebugStepResult,
        DebugStepStatus, RunAllResponse,
    },
};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ClientError, SyncError},
    CanvasClient, ClientEvent, NotificationLevel,
};

pub const VISIBLE_BINDING_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct DebugStepRecord {
    pub index: usize,
    pub node_id: Option<NodeId>,
    pub status: DebugStepStatus,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugSession {
    pub id: SessionId,
    pub state: DebugSessionState,
    pub nodes: Vec<NodeId>,
    pub steps: Vec<DebugStepRecord>,
    pub current_node: Option<NodeId>,
}

impl DebugSession {
    fn new(id: SessionId, nodes: Vec<NodeId>, state: DebugSessionState) -> Self {
        Self {
            id,
            state,
            nodes,
            steps: Vec::new(),
            current_node: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub value: Value,
    pub session_id: SessionId,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct SharedNamespace {
    bindings: BTreeMap<String, Binding>,
    seq: u64,
}

impl SharedNamespace {
    /// Last write wins, whichever session it came from.
    pub fn publish(&mut self, session_id: &SessionId, variables: &Map<String, Value>) {
        for (name, value) in variables {
            self.seq += 1;
            self.bindings.insert(
                name.clone(),
                Binding {
                    value: value.clone(),
                    session_id: session_id.clone(),
                    seq: self.seq,
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Most recently written public bindings first; names starting with `_` are private.
    pub fn visible_bindings(&self) -> Vec<(&str, &Binding)> {
        let mut visible: Vec<(&str, &Binding)> = self
            .bindings
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .map(|(name, binding)| (name.as_str(), binding))
            .collect();
        visible.sort_by(|a, b| b.1.seq.cmp(&a.1.seq));
        visible.truncate(VISIBLE_BINDING_LIMIT);
        visible
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

#[derive(Debug, Default)]
pub struct DebugOrchestrator {
    sessions: BTreeMap<SessionId, DebugSession>,
    namespace: SharedNamespace,
}

impl DebugOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&DebugSession> {
        self.sessions.get(session_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &DebugSession> {
        self.sessions.values()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn namespace(&self) -> &SharedNamespace {
        &self.namespace
    }

    pub fn register(
        &mut self,
        session_id: SessionId,
        nodes: Vec<NodeId>,
        state: DebugSessionState,
    ) {
        self.sessions
            .entry(session_id.clone())
            .and_modify(|session| session.state = state)
            .or_insert_with(|| DebugSession::new(session_id, nodes, state));
    }

    pub fn set_state(&mut self, session_id: &SessionId, state: DebugSessionState) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) if session.state != state => {
                session.state = state;
                true
            }
            Some(_) => false,
            None => {
                self.register(session_id.clone(), Vec::new(), state);
                true
            }
        }
    }

    /// Records a step result once; the identical result arriving again (response and
    /// push both carry it) is ignored.
    pub fn record_step(&mut self, session_id: &SessionId, result: &DebugStepResult) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            debug!(%session_id, "step result for unknown session");
            return false;
        };

        let duplicate = session.steps.last().is_some_and(|last| {
            last.node_id == result.node_id
                && last.status == result.status
                && last.result == result.result
        });
        if duplicate {
            return false;
        }

        session.steps.push(DebugStepRecord {
            index: session.steps.len(),
            node_id: result.node_id.clone(),
            status: result.status,
            result: result.result.clone(),
        });
        session.state = match result.status {
            DebugStepStatus::Completed => DebugSessionState::Completed,
            DebugStepStatus::Paused => DebugSessionState::Paused,
            DebugStepStatus::Stepped | DebugStepStatus::Unknown => DebugSessionState::Running,
        };
        if result.node_id.is_some() {
            session.current_node = result.node_id.clone();
        }
        self.namespace.publish(session_id, &result.variables);
        true
    }

    pub fn remove(&mut self, session_id: &SessionId) -> Option<DebugSession> {
        self.sessions.remove(session_id)
    }

    /// Applies one `run-all` result table: `{session_id: {state, ...} | {error}}`.
    pub fn apply_run_all(&mut self, results: &Map<String, Value>) -> bool {
        let mut changed = false;
        for (session_id, outcome) in results {
            let session_id = SessionId::from(session_id.as_str());
            if let Some(error) = outcome.get("error").and_then(Value::as_str) {
                warn!(%session_id, %error, "debug session failed during run-all");
                continue;
            }
            let state = outcome
                .get("state")
                .and_then(|state| serde_json::from_value(state.clone()).ok())
                .unwrap_or(DebugSessionState::Completed);
            changed |= self.set_state(&session_id, state);
            if let Some(Value::Object(variables)) = outcome.get("variables") {
                self.namespace.publish(&session_id, variables);
            }
        }
        changed
    }

    pub fn apply_listing(&mut self, listing: &DebugSessionList) -> bool {
        let mut changed = false;
        for info in &listing.sessions {
            changed |= self.set_state(&info.id, info.state);
            if let Some(session) = self.sessions.get_mut(&info.id) {
                if info.current_node.is_some() && session.current_node != info.current_node {
                    session.current_node = info.current_node.clone();
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Outcome of stopping every session; each one succeeds or fails on its own.
#[derive(Debug, Default)]
pub struct StopAllReport {
    pub stopped: Vec<SessionId>,
    pub failed: Vec<(SessionId, SyncError)>,
}

impl StopAllReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl CanvasClient {
    pub async fn create_debug_session(
        &self,
        node_ids: &[NodeId],
        options: Map<String, Value>,
    ) -> Result<SessionId, ClientError> {
        let nodes = {
            let state = self.state.lock().await;
            node_ids
                .iter()
                .map(|node_id| -> Result<DebugNodeSpec, ClientError> {
                    let node = state
                        .graph
                        .node(node_id)
                        .ok_or_else(|| ClientError::UnknownNode(node_id.clone()))?;
                    Ok(DebugNodeSpec {
                        id: node.id.clone(),
                        code_snippet: node.parameters.source_text().unwrap_or_default().into(),
                        node_type: node.node_type.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let request = CreateDebugSessionRequest {
            session_id: SessionId::from(Uuid::new_v4().to_string()),
            nodes,
            options,
        };
        let ack = match self.sync.create_debug_session(&request).await {
            Ok(ack) => ack,
            Err(err) => {
                self.notify(
                    NotificationLevel::Error,
                    format!("Could not create debug session: {err}"),
                );
                return Err(err.into());
            }
        };

        {
            let mut state = self.state.lock().await;
            state.debug.register(
                ack.session_id.clone(),
                node_ids.to_vec(),
                ack.state,
            );
        }
        info!(
            session_id = %ack.session_id,
            nodes = node_ids.len(),
            "debug session created"
        );
        self.emit(ClientEvent::DebugSessionsChanged);
        Ok(ack.session_id)
    }

    pub async fn start_debug_session(&self, session_id: &SessionId) -> Result<(), ClientError> {
        self.require_session(session_id).await?;
        let ack = match self.sync.start_debug_session(session_id).await {
            Ok(ack) => ack,
            Err(err) => {
                self.notify(
                    NotificationLevel::Error,
                    format!("Could not start debug session: {err}"),
                );
                return Err(err.into());
            }
        };

        let next = ack.state;
        let changed = self.state.lock().await.debug.set_state(session_id, next);
        if changed {
            self.emit(ClientEvent::DebugSessionsChanged);
        }
        Ok(())
    }

    pub async fn step_debug_session(
        &self,
        session_id: &SessionId,
        step_type: StepType,
    ) -> Result<DebugStepResult, ClientError> {
        self.require_session(session_id).await?;
        let response = match self.sync.step_debug_session(session_id, step_type).await {
            Ok(response) => response,
            Err(err) => {
                self.notify(
                    NotificationLevel::Error,
                    format!("Debug step failed: {err}"),
                );
                return Err(err.into());
            }
        };

        let changed = {
            let mut state = self.state.lock().await;
            state.apply_debug_step(session_id, &response.result, Instant::now())
        };
        if changed {
            self.emit(ClientEvent::DebugSessionsChanged);
        }
        Ok(response.result)
    }

    /// A session the backend no longer knows is dropped locally as well.
    pub async fn stop_debug_session(&self, session_id: &SessionId) -> Result<(), ClientError> {
        self.require_session(session_id).await?;
        match self.sync.stop_debug_session(session_id).await {
            Ok(()) => {}
            Err(SyncError::Rejected(api)) if api.code == ErrorCode::NotFound => {
                debug!(%session_id, "backend already dropped debug session");
            }
            Err(err) => {
                self.notify(
                    NotificationLevel::Error,
                    format!("Could not stop debug session: {err}"),
                );
                return Err(err.into());
            }
        }

        let removed = self.state.lock().await.remove_debug_session(session_id);
        if removed {
            self.emit(ClientEvent::DebugSessionsChanged);
        }
        Ok(())
    }

    pub async fn stop_all_debug_sessions(&self) -> StopAllReport {
        let session_ids = self.state.lock().await.debug.session_ids();
        let mut report = StopAllReport::default();

        for session_id in session_ids {
            match self.sync.stop_debug_session(&session_id).await {
                Ok(()) => {
                    self.state.lock().await.remove_debug_session(&session_id);
                    report.stopped.push(session_id);
                }
                Err(SyncError::Rejected(api)) if api.code == ErrorCode::NotFound => {
                    self.state.lock().await.remove_debug_session(&session_id);
                    report.stopped.push(session_id);
                }
                Err(err) => {
                    warn!(%session_id, "failed to stop debug session: {err}");
                    report.failed.push((session_id, err));
                }
            }
        }

        if !report.failed.is_empty() {
            let failed = report.failed.len();
            self.notify(
                NotificationLevel::Warning,
                format!("{failed} debug session(s) could not be stopped"),
            );
        }
        if !report.stopped.is_empty() {
            self.emit(ClientEvent::DebugSessionsChanged);
        }
        report
    }

    pub async fn run_all_debug_sessions(&self) -> Result<RunAllResponse, ClientError> {
        let timeout = self.settings.run_all_timeout();
        let response = match self.sync.run_all_debug_sessions(timeout).await {
            Ok(response) => response,
            Err(err) => {
                self.notify(
                    NotificationLevel::Error,
                    format!("Run all sessions failed: {err}"),
                );
                return Err(err.into());
            }
        };

        let results = &response.results;
        let changed = self.state.lock().await.debug.apply_run_all(results);
        if changed {
            self.emit(ClientEvent::DebugSessionsChanged);
        }
        Ok(response)
    }

    pub async fn refresh_debug_sessions(&self) -> Result<(), ClientError> {
        let listing = self.sync.list_debug_sessions().await?;
        let changed = self.state.lock().await.debug.apply_listing(&listing);
        if changed {
            self.emit(ClientEvent::DebugSessionsChanged);
        }
        Ok(())
    }

    async fn require_session(&self, session_id: &SessionId) -> Result<(), ClientError> {
        if self.state.lock().await.debug.session(session_id).is_none() {
            return Err(ClientError::UnknownSession(session_id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/debug_tests.rs"]
mod tests;
