//! Canonical node/connection model shared by the wire protocol and the local snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ConnectionId, NodeId};

pub const UNCONSTRAINED_PORT_TYPE: &str = "any";

/// Canvas-space position. Serialized as the ordered pair `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn lerp(self, to: Position, t: f64) -> Position {
        let t = t.clamp(0.0, 1.0);
        Position {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
        }
    }
}

impl From<[f64; 2]> for Position {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Position> for [f64; 2] {
    fn from(value: Position) -> Self {
        [value.x, value.y]
    }
}

fn unconstrained_port_type() -> String {
    UNCONSTRAINED_PORT_TYPE.to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    #[serde(rename = "type", default = "unconstrained_port_type")]
    pub port_type: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
}

impl Port {
    pub fn new(name: impl Into<String>, port_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port_type: port_type.into(),
            required: false,
        }
    }

    pub fn unconstrained(name: impl Into<String>) -> Self {
        Self::new(name, UNCONSTRAINED_PORT_TYPE)
    }
}

/// Node parameter bag. Recognized fields are typed; everything else rides in `extra`
/// untouched so a save/load cycle returns what the backend sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_title: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_ports: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeParameters {
    /// Lenient decode: a bag whose recognized fields carry unexpected types is kept
    /// whole in `extra` instead of being rejected.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => match serde_json::from_value(Value::Object(map.clone())) {
                Ok(decoded) => decoded,
                Err(_) => Self {
                    extra: map,
                    ..Self::default()
                },
            },
            _ => Self::default(),
        }
    }

    pub fn source_text(&self) -> Option<&str> {
        self.source_code
            .as_deref()
            .or(self.code.as_deref())
            .filter(|code| !code.is_empty())
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Shallow merge, key by key, the way the backend's PATCH route merges.
    pub fn merged_with(&self, partial: &Map<String, Value>) -> Self {
        let mut map = self.to_map();
        for (key, value) in partial {
            map.insert(key.clone(), value.clone());
        }
        Self::from_value(Value::Object(map))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeMetadata {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => match serde_json::from_value(Value::Object(map.clone())) {
                Ok(decoded) => decoded,
                Err(_) => Self {
                    extra: map,
                    ..Self::default()
                },
            },
            _ => Self::default(),
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn merged_with(&self, partial: &Map<String, Value>) -> Self {
        let mut map = self.to_map();
        for (key, value) in partial {
            map.insert(key.clone(), value.clone());
        }
        Self::from_value(Value::Object(map))
    }
}

fn default_node_type() -> String {
    "custom".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub parameters: NodeParameters,
    #[serde(default)]
    pub metadata: NodeMetadata,
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position,
            parameters: NodeParameters::default(),
            metadata: NodeMetadata::default(),
            inputs: vec![Port::unconstrained("input")],
            outputs: vec![Port::unconstrained("output")],
        }
    }

    pub fn display_name(&self) -> &str {
        self.parameters
            .name
            .as_deref()
            .or(self.metadata.display_name.as_deref())
            .or(self.metadata.raw_name.as_deref())
            .unwrap_or(&self.node_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source_node_id: NodeId,
    pub source_port: String,
    pub target_node_id: NodeId,
    pub target_port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl Connection {
    pub fn touches(&self, node_id: &NodeId) -> bool {
        &self.source_node_id == node_id || &self.target_node_id == node_id
    }

    pub fn is_self_loop(&self) -> bool {
        self.source_node_id == self.target_node_id
    }
}

fn default_zoom() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportState {
    #[serde(default = "default_zoom")]
    pub zoom: f64,
    #[serde(default)]
    pub pan_x: f64,
    #[serde(default)]
    pub pan_y: f64,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            zoom: default_zoom(),
            pan_x: 0.0,
            pan_y: 0.0,
        }
    }
}

/// The canonical persisted form of the full graph plus viewport.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub viewport: ViewportState,
}

impl CanvasSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.connections.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub project: ProjectMeta,
    pub state: CanvasSnapshot,
    #[serde(default)]
    pub engine_tabs: Vec<Value>,
}
