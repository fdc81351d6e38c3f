//! Canonical in-memory node/connection graph.
//!
//! Every mutation compares against the current value before writing, so repeating
//! an upsert or remove leaves the store exactly as a single application would. The
//! revision counter only moves when something actually changed.

use std::collections::{BTreeMap, BTreeSet};

use shared::{
    domain::{ConnectionId, NodeId, NodeIdentity},
    graph::{CanvasSnapshot, Connection, Node, NodeMetadata, NodeParameters, Port, Position},
};
use tracing::debug;

use crate::error::GraphError;

pub const NODE_WIDTH: f64 = 200.0;
pub const NODE_HEADER_HEIGHT: f64 = 32.0;
pub const PORT_SPACING: f64 = 22.0;
const NODE_MIN_BODY_HEIGHT: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSide {
    Input,
    Output,
}

/// Sub-trees to replace on an existing node. `None` leaves that sub-tree alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub node_type: Option<String>,
    pub position: Option<Position>,
    pub parameters: Option<NodeParameters>,
    pub metadata: Option<NodeMetadata>,
    pub inputs: Option<Vec<Port>>,
    pub outputs: Option<Vec<Port>>,
}

impl NodePatch {
    pub fn position(position: Position) -> Self {
        Self {
            position: Some(position),
            ..Self::default()
        }
    }

    pub fn parameters(parameters: NodeParameters) -> Self {
        Self {
            parameters: Some(parameters),
            ..Self::default()
        }
    }

    pub fn metadata(metadata: NodeMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    pub fn ports(inputs: Vec<Port>, outputs: Vec<Port>) -> Self {
        Self {
            inputs: Some(inputs),
            outputs: Some(outputs),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_type.is_none()
            && self.position.is_none()
            && self.parameters.is_none()
            && self.metadata.is_none()
            && self.inputs.is_none()
            && self.outputs.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemovedNode {
    pub node: Node,
    pub connections: Vec<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct GraphStore {
    nodes: BTreeMap<NodeId, Node>,
    connections: BTreeMap<ConnectionId, Connection>,
    local_fallback: BTreeSet<NodeId>,
    local_connections: BTreeSet<ConnectionId>,
    revision: u64,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.connections.is_empty()
    }

    pub fn upsert_node(&mut self, node: Node) -> bool {
        if self.nodes.get(&node.id) == Some(&node) {
            return false;
        }
        self.nodes.insert(node.id.clone(), node);
        self.revision += 1;
        true
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Option<RemovedNode> {
        let node = self.nodes.remove(id)?;
        let cascaded: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| connection.touches(id))
            .map(|connection| connection.id.clone())
            .collect();
        for connection_id in &cascaded {
            self.connections.remove(connection_id);
            self.local_connections.remove(connection_id);
        }
        self.local_fallback.remove(id);
        self.revision += 1;
        Some(RemovedNode {
            node,
            connections: cascaded,
        })
    }

    pub fn upsert_connection(&mut self, connection: Connection) -> Result<bool, GraphError> {
        if connection.is_self_loop() {
            return Err(GraphError::SelfLoop {
                connection_id: connection.id.clone(),
                node_id: connection.source_node_id.clone(),
            });
        }
        if self.connections.get(&connection.id) == Some(&connection) {
            return Ok(false);
        }
        self.connections.insert(connection.id.clone(), connection);
        self.revision += 1;
        Ok(true)
    }

    pub fn remove_connection(&mut self, id: &ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(id)?;
        self.local_connections.remove(id);
        self.revision += 1;
        Some(removed)
    }

    pub fn patch_node_fields(&mut self, id: &NodeId, patch: NodePatch) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            debug!(node_id = %id, "ignoring patch for unknown node");
            return false;
        };

        let mut changed = false;
        if let Some(node_type) = patch.node_type {
            changed |= replace_if_different(&mut node.node_type, node_type);
        }
        if let Some(position) = patch.position {
            changed |= replace_if_different(&mut node.position, position);
        }
        if let Some(parameters) = patch.parameters {
            changed |= replace_if_different(&mut node.parameters, parameters);
        }
        if let Some(metadata) = patch.metadata {
            changed |= replace_if_different(&mut node.metadata, metadata);
        }
        if let Some(inputs) = patch.inputs {
            changed |= replace_if_different(&mut node.inputs, inputs);
        }
        if let Some(outputs) = patch.outputs {
            changed |= replace_if_different(&mut node.outputs, outputs);
        }

        if changed {
            self.revision += 1;
        }
        changed
    }

    pub fn clear(&mut self) -> bool {
        if self.is_empty() && self.local_fallback.is_empty() {
            return false;
        }
        self.nodes.clear();
        self.connections.clear();
        self.local_fallback.clear();
        self.local_connections.clear();
        self.revision += 1;
        true
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections whose endpoints both exist. Dangling edges are kept but never drawn.
    pub fn renderable_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(|connection| {
            self.nodes.contains_key(&connection.source_node_id)
                && self.nodes.contains_key(&connection.target_node_id)
        })
    }

    pub fn connections_for<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Connection> {
        self.connections
            .values()
            .filter(move |connection| connection.touches(id))
    }

    pub fn node_center(&self, id: &NodeId) -> Option<Position> {
        let node = self.nodes.get(id)?;
        let height = node_height(node);
        Some(Position::new(
            node.position.x + NODE_WIDTH / 2.0,
            node.position.y + height / 2.0,
        ))
    }

    pub fn port_anchor(&self, id: &NodeId, port: &str, side: PortSide) -> Option<Position> {
        let node = self.nodes.get(id)?;
        let (ports, x) = match side {
            PortSide::Input => (&node.inputs, node.position.x),
            PortSide::Output => (&node.outputs, node.position.x + NODE_WIDTH),
        };
        let index = ports.iter().position(|candidate| candidate.name == port)?;
        Some(Position::new(
            x,
            node.position.y + NODE_HEADER_HEIGHT + PORT_SPACING * (index as f64 + 0.5),
        ))
    }

    pub fn mark_local_fallback(&mut self, id: &NodeId) {
        self.local_fallback.insert(id.clone());
    }

    pub fn mark_local_connection(&mut self, id: &ConnectionId) {
        self.local_connections.insert(id.clone());
    }

    pub fn is_local_connection(&self, id: &ConnectionId) -> bool {
        self.local_connections.contains(id)
    }

    pub fn identity(&self, id: &NodeId) -> Option<NodeIdentity> {
        if !self.nodes.contains_key(id) {
            return None;
        }
        if self.local_fallback.contains(id) {
            Some(NodeIdentity::LocalFallback(id.clone()))
        } else {
            Some(NodeIdentity::Remote(id.clone()))
        }
    }

    pub fn is_local_fallback(&self, id: &NodeId) -> bool {
        self.local_fallback.contains(id)
    }

    pub fn local_fallback_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.local_fallback.iter()
    }

    pub fn snapshot_parts(&self) -> (Vec<Node>, Vec<Connection>) {
        (
            self.nodes.values().cloned().collect(),
            self.connections.values().cloned().collect(),
        )
    }

    /// Replaces the whole graph from a bulk load. Self-loops are dropped.
    pub fn replace_all(&mut self, nodes: Vec<Node>, connections: Vec<Connection>) {
        self.nodes.clear();
        self.connections.clear();
        self.local_fallback.clear();
        self.local_connections.clear();
        for node in nodes {
            self.nodes.insert(node.id.clone(), node);
        }
        for connection in connections {
            if connection.is_self_loop() {
                debug!(
                    connection_id = %connection.id,
                    "dropping self-loop from bulk load"
                );
                continue;
            }
            self.connections.insert(connection.id.clone(), connection);
        }
        self.revision += 1;
    }

    pub fn bounds(&self) -> Option<(Position, Position)> {
        let mut nodes = self.nodes.values();
        let first = nodes.next()?;
        let mut min = first.position;
        let mut max = Position::new(
            first.position.x + NODE_WIDTH,
            first.position.y + node_height(first),
        );
        for node in nodes {
            min.x = min.x.min(node.position.x);
            min.y = min.y.min(node.position.y);
            max.x = max.x.max(node.position.x + NODE_WIDTH);
            max.y = max.y.max(node.position.y + node_height(node));
        }
        Some((min, max))
    }

    pub fn snapshot_with(&self, viewport: shared::graph::ViewportState) -> CanvasSnapshot {
        let (nodes, connections) = self.snapshot_parts();
        CanvasSnapshot {
            nodes,
            connections,
            viewport,
        }
    }
}

fn node_height(node: &Node) -> f64 {
    let rows = node.inputs.len().max(node.outputs.len()) as f64;
    NODE_HEADER_HEIGHT + (PORT_SPACING * rows).max(NODE_MIN_BODY_HEIGHT)
}

fn replace_if_different<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
#[path = "tests/graph_store_tests.rs"]
mod tests;
