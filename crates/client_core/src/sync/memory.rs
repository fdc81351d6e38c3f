//! In-process backend used for offline sessions and tests.
//!
//! Mirrors the real backend's observable behavior: mutations answer with the
//! assigned ids, and every accepted change is echoed as a push event to whoever
//! subscribed.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use shared::{
    domain::{ConnectionId, DebugSessionState, ExecutionMode, NodeId, SessionId, StepType},
    error::{ApiError, ErrorCode},
    graph::{Connection, Node, NodeMetadata, NodeParameters, Position, ViewportState},
    protocol::{
        CanvasLoad, CodeExportRequest, CreateConnectionRequest, CreateDebugSessionRequest,
        CreateNodeRequest, DebugNodeSpec, DebugSessionAck, DebugSessionInfo, DebugSessionList,
        DebugStepResponse, DebugStepResult, DebugStepStatus, PatternRefactorRequest,
        PatternSearchRequest, PortsUpdate, PushEvent, RunAllResponse, ViewportUpdate,
    },
};
use tokio::sync::{mpsc, Mutex};

use super::{SyncChannel, SyncResult};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: &'static str,
    pub target: Option<String>,
}

struct FailureRule {
    operation: &'static str,
    /// Calls of `operation` still allowed to succeed before this rule fires.
    skip: usize,
    /// `None` fires forever.
    remaining: Option<usize>,
    error: SyncError,
}

struct MemorySession {
    nodes: Vec<DebugNodeSpec>,
    state: DebugSessionState,
    cursor: usize,
    scripted: VecDeque<DebugStepResult>,
    results: Map<String, Value>,
}

#[derive(Default)]
struct MemoryBackend {
    nodes: BTreeMap<NodeId, Node>,
    connections: BTreeMap<ConnectionId, Connection>,
    viewport: ViewportState,
    sessions: BTreeMap<SessionId, MemorySession>,
    paradigm: Option<String>,
    next_id: u64,
    calls: Vec<RecordedCall>,
    call_counts: HashMap<&'static str, usize>,
    failures: Vec<FailureRule>,
    pushes: Option<mpsc::UnboundedSender<PushEvent>>,
}

impl MemoryBackend {
    fn begin(&mut self, operation: &'static str, target: Option<String>) -> SyncResult<()> {
        self.calls.push(RecordedCall { operation, target });
        let call_index = {
            let count = self.call_counts.entry(operation).or_default();
            *count += 1;
            *count - 1
        };

        let Some(position) = self.failures.iter().position(|rule| {
            rule.operation == operation && call_index >= rule.skip && rule.remaining != Some(0)
        }) else {
            return Ok(());
        };
        let rule = &mut self.failures[position];
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(rule.error.clone())
    }

    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn push(&self, event: PushEvent) {
        if let Some(pushes) = &self.pushes {
            let _ = pushes.send(event);
        }
    }

    fn node_or_not_found(&self, node_id: &NodeId) -> SyncResult<&Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| not_found(format!("node {node_id} not found")))
    }

    fn session_or_not_found(&mut self, session_id: &SessionId) -> SyncResult<&mut MemorySession> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(format!("session {session_id} not found")))
    }
}

fn not_found(message: String) -> SyncError {
    SyncError::Rejected(ApiError::new(ErrorCode::NotFound, message))
}

pub struct MemorySyncChannel {
    backend: Mutex<MemoryBackend>,
}

impl Default for MemorySyncChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySyncChannel {
    pub fn new() -> Self {
        Self {
            backend: Mutex::new(MemoryBackend::default()),
        }
    }

    /// Every accepted mutation is echoed on the returned stream. A later call
    /// replaces the previous subscriber.
    pub async fn subscribe_pushes(&self) -> mpsc::UnboundedReceiver<PushEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.backend.lock().await.pushes = Some(tx);
        rx
    }

    pub async fn fail_always(&self, operation: &'static str, error: SyncError) {
        self.backend.lock().await.failures.push(FailureRule {
            operation,
            skip: 0,
            remaining: None,
            error,
        });
    }

    /// The `nth` call (zero based, counted from the start) of `operation` fails once.
    pub async fn fail_call(&self, operation: &'static str, nth: usize, error: SyncError) {
        self.backend.lock().await.failures.push(FailureRule {
            operation,
            skip: nth,
            remaining: Some(1),
            error,
        });
    }

    pub async fn clear_failures(&self) {
        self.backend.lock().await.failures.clear();
    }

    /// Queues the result the next step of `session_id` answers with.
    pub async fn script_step(&self, session_id: &SessionId, result: DebugStepResult) {
        if let Some(session) = self.backend.lock().await.sessions.get_mut(session_id) {
            session.scripted.push_back(result);
        }
    }

    pub async fn seed_node(&self, node: Node) {
        let mut backend = self.backend.lock().await;
        backend.nodes.insert(node.id.clone(), node);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.backend.lock().await.calls.clone()
    }

    pub async fn call_count(&self, operation: &str) -> usize {
        self.backend
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.backend.lock().await.nodes.values().cloned().collect()
    }

    pub async fn connections(&self) -> Vec<Connection> {
        let backend = self.backend.lock().await;
        backend.connections.values().cloned().collect()
    }
}

#[async_trait]
impl SyncChannel for MemorySyncChannel {
    async fn fetch_canvas(&self) -> SyncResult<CanvasLoad> {
        let mut backend = self.backend.lock().await;
        backend.begin("fetch_canvas", None)?;
        Ok(CanvasLoad {
            nodes: backend.nodes.values().cloned().collect(),
            connections: backend.connections.values().cloned().collect(),
            viewport: backend.viewport,
        })
    }

    async fn create_node(&self, request: &CreateNodeRequest) -> SyncResult<NodeId> {
        let mut backend = self.backend.lock().await;
        backend.begin("create_node", Some(request.node_type.clone()))?;
        let node_id = NodeId::from(backend.allocate("node"));
        let mut node = Node::new(node_id.clone(), request.node_type.clone(), request.position);
        node.parameters = request.parameters.clone();
        node.metadata = request.metadata.clone();
        if !request.inputs.is_empty() {
            node.inputs = request.inputs.clone();
        }
        if !request.outputs.is_empty() {
            node.outputs = request.outputs.clone();
        }
        backend.nodes.insert(node_id.clone(), node.clone());
        backend.push(PushEvent::NodeAdded { node });
        Ok(node_id)
    }

    async fn move_node(&self, node_id: &NodeId, position: Position) -> SyncResult<()> {
        let mut backend = self.backend.lock().await;
        backend.begin("move_node", Some(node_id.to_string()))?;
        backend.node_or_not_found(node_id)?;
        if let Some(node) = backend.nodes.get_mut(node_id) {
            node.position = position;
        }
        backend.push(PushEvent::NodeMoved {
            node_id: node_id.clone(),
            position,
        });
        Ok(())
    }

    async fn delete_node(&self, node_id: &NodeId) -> SyncResult<()> {
        let mut backend = self.backend.lock().await;
        backend.begin("delete_node", Some(node_id.to_string()))?;
        if backend.nodes.remove(node_id).is_none() {
            return Err(not_found(format!("node {node_id} not found")));
        }
        backend
            .connections
            .retain(|_, connection| !connection.touches(node_id));
        backend.push(PushEvent::NodeRemoved {
            node_id: node_id.clone(),
        });
        Ok(())
    }

    async fn update_node_parameters(
        &self,
        node_id: &NodeId,
        parameters: &Map<String, Value>,
    ) -> SyncResult<NodeParameters> {
        let mut backend = self.backend.lock().await;
        backend.begin("update_node_parameters", Some(node_id.to_string()))?;
        let current = backend.node_or_not_found(node_id)?;
        let merged = current.parameters.merged_with(parameters);
        if let Some(node) = backend.nodes.get_mut(node_id) {
            node.parameters = merged.clone();
        }
        backend.push(PushEvent::NodeParametersUpdated {
            node_id: node_id.clone(),
            parameters: merged.clone(),
        });
        Ok(merged)
    }

    async fn update_node_metadata(
        &self,
        node_id: &NodeId,
        metadata: &Map<String, Value>,
    ) -> SyncResult<NodeMetadata> {
        let mut backend = self.backend.lock().await;
        backend.begin("update_node_metadata", Some(node_id.to_string()))?;
        let current = backend.node_or_not_found(node_id)?;
        let merged = current.metadata.merged_with(metadata);
        if let Some(node) = backend.nodes.get_mut(node_id) {
            node.metadata = merged.clone();
        }
        backend.push(PushEvent::NodeMetadataUpdated {
            node_id: node_id.clone(),
            metadata: merged.clone(),
        });
        Ok(merged)
    }

    async fn update_node_ports(
        &self,
        node_id: &NodeId,
        ports: &PortsUpdate,
    ) -> SyncResult<PortsUpdate> {
        let mut backend = self.backend.lock().await;
        backend.begin("update_node_ports", Some(node_id.to_string()))?;
        backend.node_or_not_found(node_id)?;
        if let Some(node) = backend.nodes.get_mut(node_id) {
            node.inputs = ports.inputs.clone();
            node.outputs = ports.outputs.clone();
        }
        backend.push(PushEvent::NodePortsUpdated {
            node_id: node_id.clone(),
            inputs: ports.inputs.clone(),
            outputs: ports.outputs.clone(),
        });
        Ok(ports.clone())
    }

    async fn create_connection(
        &self,
        request: &CreateConnectionRequest,
    ) -> SyncResult<ConnectionId> {
        let mut backend = self.backend.lock().await;
        backend.begin(
            "create_connection",
            Some(format!("{}->{}", request.source_node_id, request.target_node_id)),
        )?;
        backend.node_or_not_found(&request.source_node_id)?;
        backend.node_or_not_found(&request.target_node_id)?;
        if request.source_node_id == request.target_node_id {
            return Err(SyncError::Rejected(ApiError::new(
                ErrorCode::Validation,
                "cannot connect a node to itself",
            )));
        }
        let connection_id = ConnectionId::from(backend.allocate("conn"));
        let connection = Connection {
            id: connection_id.clone(),
            source_node_id: request.source_node_id.clone(),
            source_port: request.source_port.clone(),
            target_node_id: request.target_node_id.clone(),
            target_port: request.target_port.clone(),
            data_type: None,
        };
        backend
            .connections
            .insert(connection_id.clone(), connection.clone());
        backend.push(PushEvent::ConnectionAdded { connection });
        Ok(connection_id)
    }

    async fn delete_connection(&self, connection_id: &ConnectionId) -> SyncResult<()> {
        let mut backend = self.backend.lock().await;
        backend.begin("delete_connection", Some(connection_id.to_string()))?;
        if backend.connections.remove(connection_id).is_none() {
            return Err(not_found(format!("connection {connection_id} not found")));
        }
        backend.push(PushEvent::ConnectionRemoved {
            connection_id: connection_id.clone(),
        });
        Ok(())
    }

    async fn clear_canvas(&self) -> SyncResult<()> {
        let mut backend = self.backend.lock().await;
        backend.begin("clear_canvas", None)?;
        backend.nodes.clear();
        backend.connections.clear();
        backend.push(PushEvent::CanvasCleared);
        Ok(())
    }

    async fn set_viewport_zoom(&self, zoom: f64, center: (f64, f64)) -> SyncResult<ViewportUpdate> {
        let mut backend = self.backend.lock().await;
        backend.begin("set_viewport_zoom", None)?;
        let old_zoom = backend.viewport.zoom;
        let new_zoom = zoom.clamp(0.1, 5.0);
        let ratio = new_zoom / old_zoom;
        backend.viewport.pan_x = center.0 - (center.0 - backend.viewport.pan_x) * ratio;
        backend.viewport.pan_y = center.1 - (center.1 - backend.viewport.pan_y) * ratio;
        backend.viewport.zoom = new_zoom;
        let update = viewport_update(backend.viewport);
        backend.push(PushEvent::ViewportChanged(update));
        Ok(update)
    }

    async fn pan_viewport(&self, delta_x: f64, delta_y: f64) -> SyncResult<ViewportUpdate> {
        let mut backend = self.backend.lock().await;
        backend.begin("pan_viewport", None)?;
        backend.viewport.pan_x += delta_x;
        backend.viewport.pan_y += delta_y;
        let update = viewport_update(backend.viewport);
        backend.push(PushEvent::ViewportChanged(update));
        Ok(update)
    }

    async fn start_execution(&self, mode: ExecutionMode) -> SyncResult<Value> {
        let mut backend = self.backend.lock().await;
        backend.begin("start_execution", None)?;
        Ok(json!({ "mode": mode, "nodes": backend.nodes.len() }))
    }

    async fn step_execution(&self) -> SyncResult<Value> {
        self.backend.lock().await.begin("step_execution", None)?;
        Ok(json!({ "stepped": true }))
    }

    async fn stop_execution(&self) -> SyncResult<Value> {
        self.backend.lock().await.begin("stop_execution", None)?;
        Ok(json!({ "stopped": true }))
    }

    async fn create_debug_session(
        &self,
        request: &CreateDebugSessionRequest,
    ) -> SyncResult<DebugSessionAck> {
        let mut backend = self.backend.lock().await;
        backend.begin("create_debug_session", Some(request.session_id.to_string()))?;
        backend.sessions.insert(
            request.session_id.clone(),
            MemorySession {
                nodes: request.nodes.clone(),
                state: DebugSessionState::Created,
                cursor: 0,
                scripted: VecDeque::new(),
                results: Map::new(),
            },
        );
        Ok(DebugSessionAck {
            session_id: request.session_id.clone(),
            state: DebugSessionState::Created,
        })
    }

    async fn start_debug_session(&self, session_id: &SessionId) -> SyncResult<DebugSessionAck> {
        let mut backend = self.backend.lock().await;
        backend.begin("start_debug_session", Some(session_id.to_string()))?;
        backend.session_or_not_found(session_id)?.state = DebugSessionState::Running;
        backend.push(PushEvent::DebugSessionStarted {
            session_id: session_id.clone(),
            state: DebugSessionState::Running,
        });
        Ok(DebugSessionAck {
            session_id: session_id.clone(),
            state: DebugSessionState::Running,
        })
    }

    async fn step_debug_session(
        &self,
        session_id: &SessionId,
        _step_type: StepType,
    ) -> SyncResult<DebugStepResponse> {
        let mut backend = self.backend.lock().await;
        backend.begin("step_debug_session", Some(session_id.to_string()))?;
        let session = backend.session_or_not_found(session_id)?;

        let result = match session.scripted.pop_front() {
            Some(result) => result,
            None => match session.nodes.get(session.cursor) {
                Some(entry) => {
                    let mut variables = Map::new();
                    variables.insert("last_node".into(), json!(entry.id));
                    variables.insert(format!("_{session_id}_cursor"), json!(session.cursor + 1));
                    DebugStepResult {
                        status: DebugStepStatus::Stepped,
                        node_id: Some(entry.id.clone()),
                        result: json!({ "executed": entry.code_snippet }),
                        variables,
                    }
                }
                None => DebugStepResult {
                    status: DebugStepStatus::Completed,
                    node_id: None,
                    result: Value::Object(session.results.clone()),
                    variables: Map::new(),
                },
            },
        };

        match result.status {
            DebugStepStatus::Completed => session.state = DebugSessionState::Completed,
            DebugStepStatus::Paused => session.state = DebugSessionState::Paused,
            _ => {
                session.state = DebugSessionState::Running;
                session.cursor += 1;
            }
        }
        if let Some(node_id) = &result.node_id {
            session
                .results
                .insert(node_id.to_string(), result.result.clone());
        }

        backend.push(PushEvent::DebugStepExecuted {
            session_id: session_id.clone(),
            result: result.clone(),
        });
        Ok(DebugStepResponse {
            session_id: session_id.clone(),
            result,
        })
    }

    async fn stop_debug_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let mut backend = self.backend.lock().await;
        backend.begin("stop_debug_session", Some(session_id.to_string()))?;
        if backend.sessions.remove(session_id).is_none() {
            return Err(not_found(format!("session {session_id} not found")));
        }
        backend.push(PushEvent::DebugSessionStopped {
            session_id: session_id.clone(),
        });
        Ok(())
    }

    async fn run_all_debug_sessions(&self, timeout: Duration) -> SyncResult<RunAllResponse> {
        let mut backend = self.backend.lock().await;
        backend.begin(
            "run_all_debug_sessions",
            Some(timeout.as_secs().to_string()),
        )?;
        let mut results = Map::new();
        for (session_id, session) in backend.sessions.iter_mut() {
            for entry in &session.nodes[session.cursor.min(session.nodes.len())..] {
                session.results.insert(
                    entry.id.to_string(),
                    json!({ "executed": entry.code_snippet }),
                );
            }
            session.cursor = session.nodes.len();
            session.state = DebugSessionState::Completed;
            results.insert(
                session_id.to_string(),
                json!({ "state": session.state, "results": session.results }),
            );
        }
        backend.push(PushEvent::AllSessionsCompleted {
            results: results.clone(),
        });
        Ok(RunAllResponse { results })
    }

    async fn list_debug_sessions(&self) -> SyncResult<DebugSessionList> {
        let mut backend = self.backend.lock().await;
        backend.begin("list_debug_sessions", None)?;
        let sessions = backend
            .sessions
            .iter()
            .map(|(session_id, session)| DebugSessionInfo {
                id: session_id.clone(),
                state: session.state,
                current_node: session
                    .cursor
                    .checked_sub(1)
                    .and_then(|index| session.nodes.get(index))
                    .map(|entry| entry.id.clone()),
                results: session.results.clone(),
                variables: Map::new(),
            })
            .collect();
        Ok(DebugSessionList { sessions })
    }

    async fn pattern_search(&self, request: &PatternSearchRequest) -> SyncResult<Value> {
        let mut backend = self.backend.lock().await;
        backend.begin("pattern_search", Some(request.pattern.clone()))?;
        let matches: Vec<Value> = backend
            .nodes
            .values()
            .filter(|node| {
                node.parameters
                    .source_text()
                    .is_some_and(|code| code.contains(&request.pattern))
            })
            .map(|node| json!({ "node_id": node.id }))
            .collect();
        Ok(json!({ "pattern": request.pattern, "matches": matches }))
    }

    async fn pattern_refactor(&self, request: &PatternRefactorRequest) -> SyncResult<Value> {
        let mut backend = self.backend.lock().await;
        backend.begin("pattern_refactor", Some(request.search_pattern.clone()))?;
        let mut changed = Vec::new();
        for node in backend.nodes.values_mut() {
            if let Some(scope) = &request.node_ids {
                if !scope.contains(&node.id) {
                    continue;
                }
            }
            let Some(code) = node.parameters.source_text() else {
                continue;
            };
            if !code.contains(&request.search_pattern) {
                continue;
            }
            let refactored = code.replace(&request.search_pattern, &request.replace_pattern);
            if request.apply {
                node.parameters.source_code = Some(refactored.clone());
            }
            changed.push((node.id.clone(), refactored));
        }
        if request.apply {
            for (node_id, refactored) in &changed {
                let mut changes = Map::new();
                changes.insert("source_code".into(), json!(refactored));
                backend.push(PushEvent::NodeUpdated {
                    node_id: node_id.clone(),
                    changes,
                });
            }
        }
        let results: Vec<Value> = changed
            .into_iter()
            .map(|(node_id, code)| json!({ "node_id": node_id, "refactored_code": code }))
            .collect();
        Ok(json!({ "results": results, "applied": request.apply }))
    }

    async fn export_code(&self, request: &CodeExportRequest) -> SyncResult<Value> {
        let mut backend = self.backend.lock().await;
        backend.begin("export_code", Some(request.target_language.clone()))?;
        let code: Vec<&str> = request
            .nodes
            .iter()
            .filter_map(|node| node.parameters.source_text())
            .collect();
        Ok(json!({
            "language": request.target_language,
            "code": code.join("\n\n"),
        }))
    }

    async fn set_active_paradigm(&self, paradigm: &str) -> SyncResult<Option<String>> {
        let mut backend = self.backend.lock().await;
        backend.begin("set_active_paradigm", Some(paradigm.to_string()))?;
        backend.paradigm = Some(paradigm.to_string());
        backend.push(PushEvent::ParadigmChanged {
            paradigm: paradigm.to_string(),
        });
        Ok(backend.paradigm.clone())
    }
}

fn viewport_update(viewport: ViewportState) -> ViewportUpdate {
    ViewportUpdate {
        zoom: Some(viewport.zoom),
        pan_x: Some(viewport.pan_x),
        pan_y: Some(viewport.pan_y),
    }
}
