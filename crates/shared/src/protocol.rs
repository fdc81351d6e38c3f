use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{ConnectionId, DebugSessionState, NodeId, SessionId},
    graph::{Connection, Node, NodeMetadata, NodeParameters, Port, Position, ViewportState},
};

/// Response envelope used by every backend route: `{success, data?, error?}`.
///
/// A few routes put their payload next to `success` instead of under `data`; those
/// fields land in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApiEnvelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            extra: Map::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            extra: Map::new(),
        }
    }

    pub fn into_payload(self) -> Value {
        match self.data {
            Some(data) if !data.is_null() => data,
            _ => Value::Object(self.extra),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    #[serde(rename = "type")]
    pub node_type: String,
    pub position: Position,
    #[serde(default)]
    pub parameters: NodeParameters,
    #[serde(default)]
    pub metadata: NodeMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Port>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Port>,
}

impl CreateNodeRequest {
    pub fn new(node_type: impl Into<String>, position: Position) -> Self {
        Self {
            node_type: node_type.into(),
            position,
            parameters: NodeParameters::default(),
            metadata: NodeMetadata::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Replays a saved node exactly, ports included, so the backend does not fall
    /// back to its per-type default ports.
    pub fn from_node(node: &Node) -> Self {
        Self {
            node_type: node.node_type.clone(),
            position: node.position,
            parameters: node.parameters.clone(),
            metadata: node.metadata.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedNode {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConnectionRequest {
    pub source_node_id: NodeId,
    pub source_port: String,
    pub target_node_id: NodeId,
    pub target_port: String,
}

impl From<&Connection> for CreateConnectionRequest {
    fn from(value: &Connection) -> Self {
        Self {
            source_node_id: value.source_node_id.clone(),
            source_port: value.source_port.clone(),
            target_node_id: value.target_node_id.clone(),
            target_port: value.target_port.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedConnection {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParametersUpdate {
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetadataUpdate {
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PortsUpdate {
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
}

/// Viewport values echoed by the zoom/pan routes; absent fields keep local values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ViewportUpdate {
    #[serde(default)]
    pub zoom: Option<f64>,
    #[serde(default)]
    pub pan_x: Option<f64>,
    #[serde(default)]
    pub pan_y: Option<f64>,
}

/// Result of the initial bulk load.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanvasLoad {
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub viewport: ViewportState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugNodeSpec {
    pub id: NodeId,
    #[serde(default)]
    pub code_snippet: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDebugSessionRequest {
    pub session_id: SessionId,
    pub nodes: Vec<DebugNodeSpec>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSessionAck {
    pub session_id: SessionId,
    #[serde(default)]
    pub state: DebugSessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DebugStepStatus {
    #[default]
    Stepped,
    Completed,
    Paused,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DebugStepResult {
    #[serde(default)]
    pub status: DebugStepStatus,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugStepResponse {
    pub session_id: SessionId,
    #[serde(default)]
    pub result: DebugStepResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSessionInfo {
    pub id: SessionId,
    #[serde(default)]
    pub state: DebugSessionState,
    #[serde(default)]
    pub current_node: Option<NodeId>,
    #[serde(default)]
    pub results: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DebugSessionList {
    #[serde(default)]
    pub sessions: Vec<DebugSessionInfo>,
}

/// `run-all` answers one entry per session: its final state, or `{error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunAllResponse {
    #[serde(default)]
    pub results: Map<String, Value>,
}

fn default_language() -> String {
    "python".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSearchRequest {
    pub pattern: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_data: Option<Vec<Node>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRefactorRequest {
    pub search_pattern: String,
    pub replace_pattern: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<NodeId>>,
    #[serde(default)]
    pub apply: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExportRequest {
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    #[serde(default = "default_language")]
    pub target_language: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventType {
    NodeStart,
    NodeComplete,
    NodeError,
    DataFlow,
    VariableUpdate,
    BreakpointHit,
    ExecutionPause,
    ExecutionResume,
    ExecutionComplete,
    ExecutionError,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_type: ExecutionEventType,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ExecutionEvent {
    pub fn new(event_type: ExecutionEventType) -> Self {
        Self {
            event_type,
            timestamp: None,
            node_id: None,
            connection_id: None,
            data: None,
            message: None,
        }
    }

    pub fn for_node(event_type: ExecutionEventType, node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::new(event_type)
        }
    }

    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(key))
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data_field(key).and_then(Value::as_str)
    }

    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data_field(key).and_then(Value::as_f64)
    }
}

/// Backend push notifications after defensive decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    NodeAdded {
        node: Node,
    },
    NodeRemoved {
        node_id: NodeId,
    },
    NodeMoved {
        node_id: NodeId,
        position: Position,
    },
    NodeUpdated {
        node_id: NodeId,
        changes: Map<String, Value>,
    },
    NodeParametersUpdated {
        node_id: NodeId,
        parameters: NodeParameters,
    },
    NodeMetadataUpdated {
        node_id: NodeId,
        metadata: NodeMetadata,
    },
    NodePortsUpdated {
        node_id: NodeId,
        inputs: Vec<Port>,
        outputs: Vec<Port>,
    },
    ConnectionAdded {
        connection: Connection,
    },
    ConnectionRemoved {
        connection_id: ConnectionId,
    },
    CanvasCleared,
    ViewportChanged(ViewportUpdate),
    ParadigmChanged {
        paradigm: String,
    },
    Execution(ExecutionEvent),
    DebugSessionStarted {
        session_id: SessionId,
        state: DebugSessionState,
    },
    DebugStepExecuted {
        session_id: SessionId,
        result: DebugStepResult,
    },
    DebugSessionStopped {
        session_id: SessionId,
    },
    AllSessionsCompleted {
        results: Map<String, Value>,
    },
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeAdded { .. } => "node_added",
            Self::NodeRemoved { .. } => "node_removed",
            Self::NodeMoved { .. } => "node_moved",
            Self::NodeUpdated { .. } => "node_updated",
            Self::NodeParametersUpdated { .. } => "node_parameters_updated",
            Self::NodeMetadataUpdated { .. } => "node_metadata_updated",
            Self::NodePortsUpdated { .. } => "node_ports_updated",
            Self::ConnectionAdded { .. } => "connection_added",
            Self::ConnectionRemoved { .. } => "connection_removed",
            Self::CanvasCleared => "canvas_cleared",
            Self::ViewportChanged(_) => "viewport_changed",
            Self::ParadigmChanged { .. } => "paradigm_changed",
            Self::Execution(_) => "execution_event",
            Self::DebugSessionStarted { .. } => "debug_session_started",
            Self::DebugStepExecuted { .. } => "debug_step_executed",
            Self::DebugSessionStopped { .. } => "debug_session_stopped",
            Self::AllSessionsCompleted { .. } => "all_sessions_completed",
        }
    }
}
