//! Lenient decoding of graph-shaped JSON.
//!
//! Import files, bulk loads and push payloads come from several producers that never
//! agreed on one shape. Everything funnels through here so the rest of the crate only
//! sees canonical `shared::graph` values.

use serde_json::{Map, Value};
use shared::{
    domain::{ConnectionId, NodeId},
    graph::{
        CanvasSnapshot, Connection, Node, NodeMetadata, NodeParameters, Port, Position,
        ViewportState, UNCONSTRAINED_PORT_TYPE,
    },
};
use tracing::debug;
use uuid::Uuid;

use crate::error::PersistenceError;

const SOURCE_NODE_KEYS: &[&str] = &[
    "source_node_id",
    "source",
    "from",
    "from_node",
    "sourceNodeId",
];
const TARGET_NODE_KEYS: &[&str] = &["target_node_id", "target", "to", "to_node", "targetNodeId"];
const SOURCE_PORT_KEYS: &[&str] = &["source_port", "sourcePort", "from_port"];
const TARGET_PORT_KEYS: &[&str] = &["target_port", "targetPort", "to_port"];

/// A foreign project file after normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImportedProject {
    pub snapshot: CanvasSnapshot,
    pub project_name: Option<String>,
    pub engine_tabs: Vec<Value>,
}

pub fn normalize_import(raw: Value) -> Result<ImportedProject, PersistenceError> {
    let Value::Object(root) = raw else {
        return Err(PersistenceError::UnrecognizedDocument(
            "import root must be a JSON object".into(),
        ));
    };

    let state = match root.get("state") {
        Some(Value::Object(state)) => state,
        Some(_) => {
            return Err(PersistenceError::UnrecognizedDocument(
                "`state` must be an object".into(),
            ))
        }
        None if root.contains_key("nodes") || root.contains_key("connections") => &root,
        None => {
            return Err(PersistenceError::UnrecognizedDocument(
                "expected `state` or `nodes`".into(),
            ))
        }
    };

    let project_name = root
        .get("project")
        .and_then(|project| project.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let engine_tabs = match root.get("engine_tabs") {
        Some(Value::Array(tabs)) => tabs.clone(),
        _ => Vec::new(),
    };

    Ok(ImportedProject {
        snapshot: normalize_snapshot(state),
        project_name,
        engine_tabs,
    })
}

pub fn normalize_snapshot(state: &Map<String, Value>) -> CanvasSnapshot {
    let nodes = normalize_nodes(state.get("nodes"));
    let connections = match state.get("connections") {
        Some(Value::Array(items)) => items.iter().filter_map(normalize_connection).collect(),
        Some(Value::Object(items)) => items
            .iter()
            .filter_map(|(key, item)| {
                let mut connection = normalize_connection(item)?;
                if item.get("id").is_none() && item.get("connection_id").is_none() {
                    connection.id = ConnectionId::from(key.as_str());
                }
                Some(connection)
            })
            .collect(),
        _ => Vec::new(),
    };

    CanvasSnapshot {
        nodes,
        connections,
        viewport: normalize_viewport(state.get("viewport")),
    }
}

/// Accepts either a list of nodes or an id-keyed map of nodes.
pub fn normalize_nodes(value: Option<&Value>) -> Vec<Node> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| normalize_node(item, None))
            .collect(),
        Some(Value::Object(items)) => items
            .iter()
            .filter_map(|(key, item)| normalize_node(item, Some(key)))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn normalize_node(value: &Value, fallback_id: Option<&str>) -> Option<Node> {
    let Value::Object(fields) = value else {
        debug!("skipping non-object node entry");
        return None;
    };

    let id = string_field(fields, &["id", "node_id"])
        .or_else(|| fallback_id.map(str::to_string))
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let node_type = string_field(fields, &["type", "node_type"]).unwrap_or_else(|| "custom".into());

    Some(Node {
        id: NodeId::from(id),
        node_type,
        position: normalize_position(fields.get("position")),
        parameters: fields
            .get("parameters")
            .cloned()
            .map(NodeParameters::from_value)
            .unwrap_or_default(),
        metadata: fields
            .get("metadata")
            .cloned()
            .map(NodeMetadata::from_value)
            .unwrap_or_default(),
        inputs: normalize_ports(fields.get("inputs"), "input"),
        outputs: normalize_ports(fields.get("outputs"), "output"),
    })
}

pub fn normalize_connection(value: &Value) -> Option<Connection> {
    let Value::Object(fields) = value else {
        return None;
    };
    let Some(source) = string_field(fields, SOURCE_NODE_KEYS) else {
        debug!("skipping connection without a source node");
        return None;
    };
    let Some(target) = string_field(fields, TARGET_NODE_KEYS) else {
        debug!("skipping connection without a target node");
        return None;
    };

    let id = string_field(fields, &["id", "connection_id"])
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let data_type = string_field(fields, &["data_type", "dataType"])
        .filter(|data_type| !data_type.is_empty() && data_type != "None");

    Some(Connection {
        id: ConnectionId::from(id),
        source_node_id: NodeId::from(source),
        source_port: string_field(fields, SOURCE_PORT_KEYS).unwrap_or_else(|| "output".into()),
        target_node_id: NodeId::from(target),
        target_port: string_field(fields, TARGET_PORT_KEYS).unwrap_or_else(|| "input".into()),
        data_type,
    })
}

/// `[x, y]`, `{x, y}` or nothing at all (origin).
pub fn normalize_position(value: Option<&Value>) -> Position {
    match value {
        Some(Value::Array(pair)) if pair.len() >= 2 => Position::new(
            pair[0].as_f64().unwrap_or_default(),
            pair[1].as_f64().unwrap_or_default(),
        ),
        Some(Value::Object(fields)) => Position::new(
            fields.get("x").and_then(Value::as_f64).unwrap_or_default(),
            fields.get("y").and_then(Value::as_f64).unwrap_or_default(),
        ),
        _ => Position::default(),
    }
}

/// A missing list becomes one unconstrained port named `default_name`; a present
/// but empty list stays empty.
pub fn normalize_ports(value: Option<&Value>, default_name: &str) -> Vec<Port> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(normalize_port).collect(),
        _ => vec![Port::unconstrained(default_name)],
    }
}

fn normalize_port(value: &Value) -> Option<Port> {
    match value {
        Value::String(name) => Some(Port::unconstrained(name.clone())),
        Value::Object(fields) => {
            let name = string_field(fields, &["name"])?;
            let port_type = string_field(fields, &["type", "data_type"])
                .unwrap_or_else(|| UNCONSTRAINED_PORT_TYPE.into());
            Some(Port {
                name,
                port_type,
                required: fields
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        }
        _ => None,
    }
}

pub fn normalize_viewport(value: Option<&Value>) -> ViewportState {
    let Some(Value::Object(fields)) = value else {
        return ViewportState::default();
    };
    let mut viewport = ViewportState::default();
    let zoom = fields.get("zoom").and_then(Value::as_f64);
    if let Some(zoom) = zoom.filter(|z| *z > 0.0) {
        viewport.zoom = zoom;
    }
    let (pan_x, pan_y) = match fields.get("pan") {
        Some(pan) => {
            let position = normalize_position(Some(pan));
            (Some(position.x), Some(position.y))
        }
        None => (None, None),
    };
    viewport.pan_x = number_field(fields, &["pan_x", "panX"])
        .or(pan_x)
        .unwrap_or_default();
    viewport.pan_y = number_field(fields, &["pan_y", "panY"])
        .or(pan_y)
        .unwrap_or_default();
    viewport
}

fn string_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match fields.get(*key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    })
}

fn number_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_f64))
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;
