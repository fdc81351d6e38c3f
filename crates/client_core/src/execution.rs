//! Execution overlay: per-node highlights, data-flow markers and the event log.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use serde_json::Value;
use shared::{
    domain::{ConnectionId, NodeId},
    graph::Position,
    protocol::{DebugStepStatus, ExecutionEvent, ExecutionEventType},
};
use tokio::time::Instant;
use tracing::debug;

use crate::graph_store::GraphStore;

pub const MIN_EXECUTION_SPEED: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub enum HighlightState {
    Executing,
    Completed { elapsed: Option<Duration> },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeHighlight {
    pub state: HighlightState,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataFlowMarker {
    pub connection_id: Option<ConnectionId>,
    pub from: Position,
    pub to: Position,
    pub started_at: Instant,
    pub duration: Duration,
}

impl DataFlowMarker {
    pub fn arrives_at(&self) -> Instant {
        self.started_at + self.duration
    }

    pub fn position_at(&self, now: Instant) -> Position {
        if self.duration.is_zero() {
            return self.to;
        }
        let elapsed = now.saturating_duration_since(self.started_at);
        self.from
            .lerp(self.to, elapsed.as_secs_f64() / self.duration.as_secs_f64())
    }
}

#[derive(Debug)]
pub struct ExecutionVisualizer {
    highlights: BTreeMap<NodeId, NodeHighlight>,
    markers: Vec<DataFlowMarker>,
    current_node: Option<NodeId>,
    executing: bool,
    log: VecDeque<ExecutionEvent>,
    log_capacity: usize,
    watches: BTreeMap<String, Value>,
    highlight_duration: Duration,
    base_flow_duration: Duration,
    speed: f64,
}

impl ExecutionVisualizer {
    pub fn new(
        highlight_duration: Duration,
        base_flow_duration: Duration,
        log_capacity: usize,
    ) -> Self {
        Self {
            highlights: BTreeMap::new(),
            markers: Vec::new(),
            current_node: None,
            executing: false,
            log: VecDeque::with_capacity(log_capacity),
            log_capacity: log_capacity.max(1),
            watches: BTreeMap::new(),
            highlight_duration,
            base_flow_duration,
            speed: 1.0,
        }
    }

    pub fn set_execution_speed(&mut self, speed: f64) {
        if speed.is_finite() {
            self.speed = speed.max(MIN_EXECUTION_SPEED);
        }
    }

    pub fn execution_speed(&self) -> f64 {
        self.speed
    }

    pub fn set_highlight_duration(&mut self, duration: Duration) {
        self.highlight_duration = duration;
    }

    pub fn flow_duration(&self) -> Duration {
        self.base_flow_duration.div_f64(self.speed)
    }

    pub fn is_executing(&self) -> bool {
        self.executing
    }

    pub fn current_node(&self) -> Option<&NodeId> {
        self.current_node.as_ref()
    }

    pub fn highlight(&self, node_id: &NodeId) -> Option<&NodeHighlight> {
        self.highlights.get(node_id)
    }

    pub fn highlights(&self) -> impl Iterator<Item = (&NodeId, &NodeHighlight)> {
        self.highlights.iter()
    }

    pub fn log(&self) -> impl Iterator<Item = &ExecutionEvent> {
        self.log.iter()
    }

    pub fn watches(&self) -> &BTreeMap<String, Value> {
        &self.watches
    }

    /// Interpolated marker positions at `now`; markers already arrived are skipped.
    pub fn markers(&self, now: Instant) -> Vec<(Option<&ConnectionId>, Position)> {
        self.markers
            .iter()
            .filter(|marker| marker.arrives_at() > now)
            .map(|marker| (marker.connection_id.as_ref(), marker.position_at(now)))
            .collect()
    }

    /// Returns whether the executing flag or the current node changed.
    pub fn apply(&mut self, event: &ExecutionEvent, graph: &GraphStore, now: Instant) -> bool {
        let before = (self.executing, self.current_node.clone());
        self.append_log(event.clone());

        match event.event_type {
            ExecutionEventType::NodeStart | ExecutionEventType::BreakpointHit => {
                if let Some(node_id) = &event.node_id {
                    self.executing = true;
                    self.current_node = Some(node_id.clone());
                    let ttl = self.highlight_duration;
                    self.set_highlight(node_id, HighlightState::Executing, now, ttl);
                }
            }
            ExecutionEventType::NodeComplete => {
                if let Some(node_id) = &event.node_id {
                    let elapsed = ["execution_time", "elapsed", "duration"]
                        .iter()
                        .find_map(|key| event.data_f64(key))
                        .filter(|secs| secs.is_finite() && *secs >= 0.0)
                        .map(Duration::from_secs_f64);
                    self.set_highlight(
                        node_id,
                        HighlightState::Completed { elapsed },
                        now,
                        self.highlight_duration,
                    );
                    self.release_current(node_id);
                }
            }
            ExecutionEventType::NodeError => {
                if let Some(node_id) = &event.node_id {
                    let message = event
                        .message
                        .clone()
                        .or_else(|| event.data_str("error").map(str::to_string))
                        .unwrap_or_else(|| "execution failed".into());
                    self.set_highlight(
                        node_id,
                        HighlightState::Error { message },
                        now,
                        self.highlight_duration * 2,
                    );
                    self.release_current(node_id);
                }
            }
            ExecutionEventType::DataFlow => self.spawn_marker(event, graph, now),
            ExecutionEventType::VariableUpdate => {
                let name = event
                    .data_str("name")
                    .or_else(|| event.data_str("variable"));
                match name {
                    Some(name) => {
                        let value = event.data_field("value").cloned().unwrap_or(Value::Null);
                        self.watches.insert(name.to_string(), value);
                    }
                    None => debug!("variable update without a name"),
                }
            }
            ExecutionEventType::ExecutionComplete | ExecutionEventType::ExecutionError => {
                self.reset();
            }
            ExecutionEventType::ExecutionPause
            | ExecutionEventType::ExecutionResume
            | ExecutionEventType::Unknown => {}
        }

        before != (self.executing, self.current_node.clone())
    }

    fn append_log(&mut self, event: ExecutionEvent) {
        while self.log.len() >= self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(event);
    }

    fn set_highlight(
        &mut self,
        node_id: &NodeId,
        state: HighlightState,
        now: Instant,
        ttl: Duration,
    ) {
        self.highlights.insert(
            node_id.clone(),
            NodeHighlight {
                state,
                expires_at: now + ttl,
            },
        );
    }

    fn release_current(&mut self, node_id: &NodeId) {
        if self.current_node.as_ref() == Some(node_id) {
            self.current_node = None;
        }
    }

    fn spawn_marker(&mut self, event: &ExecutionEvent, graph: &GraphStore, now: Instant) {
        let endpoints = event
            .connection_id
            .as_ref()
            .and_then(|id| graph.connection(id))
            .map(|connection| {
                (
                    connection.source_node_id.clone(),
                    connection.target_node_id.clone(),
                )
            })
            .or_else(|| {
                let source = event.data_str("source_node")?;
                let target = event.data_str("target_node")?;
                Some((NodeId::from(source), NodeId::from(target)))
            });

        let Some((source, target)) = endpoints else {
            debug!("data flow event without resolvable endpoints");
            return;
        };
        let (Some(from), Some(to)) = (graph.node_center(&source), graph.node_center(&target)) else {
            debug!(
                %source,
                %target,
                "data flow between nodes not on the canvas"
            );
            return;
        };

        self.markers.push(DataFlowMarker {
            connection_id: event.connection_id.clone(),
            from,
            to,
            started_at: now,
            duration: self.flow_duration(),
        });
    }

    /// Drops expired highlights and arrived markers. Returns whether anything went.
    pub fn expire(&mut self, now: Instant) -> bool {
        let highlights = self.highlights.len();
        let markers = self.markers.len();
        self.highlights.retain(|_, shown| shown.expires_at > now);
        self.markers.retain(|marker| marker.arrives_at() > now);
        highlights != self.highlights.len() || markers != self.markers.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.highlights
            .values()
            .map(|highlight| highlight.expires_at)
            .chain(self.markers.iter().map(DataFlowMarker::arrives_at))
            .min()
    }

    pub fn clear_node(&mut self, node_id: &NodeId) {
        self.highlights.remove(node_id);
        self.release_current(node_id);
    }

    /// Highlight left by a debug step; debug sessions have no explicit start event.
    pub fn highlight_debug_step(
        &mut self,
        node_id: &NodeId,
        status: DebugStepStatus,
        now: Instant,
    ) {
        let state = match status {
            DebugStepStatus::Completed => HighlightState::Completed { elapsed: None },
            _ => HighlightState::Executing,
        };
        self.set_highlight(node_id, state, now, self.highlight_duration);
    }

    pub fn reset(&mut self) {
        self.executing = false;
        self.current_node = None;
        self.highlights.clear();
        self.markers.clear();
        self.log.clear();
    }
}

#[cfg(test)]
#[path = "tests/execution_tests.rs"]
mod tests;
