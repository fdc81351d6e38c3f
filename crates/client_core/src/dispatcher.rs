//! The single consumer of push notifications.
//!
//! Pushes are applied strictly in arrival order. Between messages the dispatcher
//! ticks once per frame to fire due timers: autosave, highlight expiry and marker
//! arrival.

use std::{sync::Arc, time::Duration};

use serde_json::{Map, Value};
use shared::{
    graph::{Node, NodeMetadata, NodeParameters},
    protocol::PushEvent,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{graph_store::NodePatch, normalize, CanvasClient, CanvasState, ClientEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchMessage {
    Push(PushEvent),
    PushClosed { reason: String },
    Shutdown,
}

pub struct Dispatcher {
    client: Arc<CanvasClient>,
    inbox: mpsc::Receiver<DispatchMessage>,
    frame_interval: Duration,
}

impl Dispatcher {
    pub fn new(client: Arc<CanvasClient>, inbox: mpsc::Receiver<DispatchMessage>) -> Self {
        let frame_interval = client.settings().frame_interval();
        Self {
            client,
            inbox,
            frame_interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self) {
        let mut ticker = time::interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                message = self.inbox.recv() => match message {
                    Some(DispatchMessage::Push(event)) => self.client.apply_push(event).await,
                    Some(DispatchMessage::PushClosed { reason }) => {
                        warn!(%reason, "push notifications stopped");
                        self.client.forget_clear_echoes().await;
                        self.client.emit(ClientEvent::PushChannelClosed { reason });
                    }
                    Some(DispatchMessage::Shutdown) | None => break,
                },
                _ = ticker.tick() => self.client.poll_timers(Instant::now()).await,
            }
        }
        info!("dispatcher stopped");
    }
}

/// Feeds an in-process push stream into the dispatcher queue.
pub fn forward_pushes(
    mut pushes: mpsc::UnboundedReceiver<PushEvent>,
    sink: mpsc::Sender<DispatchMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = pushes.recv().await {
            if sink.send(DispatchMessage::Push(event)).await.is_err() {
                return;
            }
        }
        let _ = sink
            .send(DispatchMessage::PushClosed {
                reason: "in-process backend dropped".into(),
            })
            .await;
    })
}

/// `node_updated` carries a loose change set. Known sub-trees replace wholesale;
/// any other key is a parameter.
fn patch_from_changes(node: &Node, changes: &Map<String, Value>) -> NodePatch {
    let mut patch = NodePatch::default();
    let mut loose = Map::new();
    for (key, value) in changes {
        match key.as_str() {
            "position" => patch.position = Some(normalize::normalize_position(Some(value))),
            "type" => patch.node_type = value.as_str().map(str::to_string),
            "parameters" => patch.parameters = Some(NodeParameters::from_value(value.clone())),
            "metadata" => patch.metadata = Some(NodeMetadata::from_value(value.clone())),
            "inputs" => patch.inputs = Some(normalize::normalize_ports(Some(value), "input")),
            "outputs" => patch.outputs = Some(normalize::normalize_ports(Some(value), "output")),
            _ => {
                loose.insert(key.clone(), value.clone());
            }
        }
    }
    if !loose.is_empty() {
        let base = patch.parameters.as_ref().unwrap_or(&node.parameters);
        patch.parameters = Some(base.merged_with(&loose));
    }
    patch
}

impl CanvasClient {
    /// Applies one push notification. Re-applying the same event changes nothing.
    pub async fn apply_push(&self, event: PushEvent) {
        let name = event.name();
        let mut state = self.state.lock().await;
        let graph_changed = match event {
            PushEvent::NodeAdded { node } => state.graph.upsert_node(node),
            PushEvent::NodeRemoved { node_id } => {
                state.visualizer.clear_node(&node_id);
                state.graph.remove_node(&node_id).is_some()
            }
            PushEvent::NodeMoved { node_id, position } => state
                .graph
                .patch_node_fields(&node_id, NodePatch::position(position)),
            PushEvent::NodeUpdated { node_id, changes } => {
                let Some(patch) = state
                    .graph
                    .node(&node_id)
                    .map(|node| patch_from_changes(node, &changes))
                else {
                    debug!(%node_id, "node_updated for unknown node");
                    return;
                };
                state.graph.patch_node_fields(&node_id, patch)
            }
            PushEvent::NodeParametersUpdated { node_id, parameters } => state
                .graph
                .patch_node_fields(&node_id, NodePatch::parameters(parameters)),
            PushEvent::NodeMetadataUpdated { node_id, metadata } => state
                .graph
                .patch_node_fields(&node_id, NodePatch::metadata(metadata)),
            PushEvent::NodePortsUpdated {
                node_id,
                inputs,
                outputs,
            } => state
                .graph
                .patch_node_fields(&node_id, NodePatch::ports(inputs, outputs)),
            PushEvent::ConnectionAdded { connection } => {
                match state.graph.upsert_connection(connection) {
                    Ok(changed) => changed,
                    Err(err) => {
                        debug!("skipping pushed connection: {err}");
                        false
                    }
                }
            }
            PushEvent::ConnectionRemoved { connection_id } => {
                state.graph.remove_connection(&connection_id).is_some()
            }
            PushEvent::CanvasCleared => {
                if state.persistence.pending_clear_echoes > 0 {
                    state.persistence.pending_clear_echoes -= 1;
                    debug!("absorbing canvas_cleared echo of a restore");
                    return;
                }
                if state.persistence.restoring {
                    debug!("ignoring canvas_cleared during restore");
                    return;
                }
                state.visualizer.reset();
                state.graph.clear()
            }
            PushEvent::ViewportChanged(update) => {
                if state
                    .viewport
                    .apply_remote(update.zoom, update.pan_x, update.pan_y)
                {
                    self.mark_dirty(&mut state);
                    self.emit(ClientEvent::ViewportChanged(state.viewport.state()));
                }
                false
            }
            PushEvent::ParadigmChanged { paradigm } => {
                if state.paradigm.as_deref() != Some(paradigm.as_str()) {
                    state.paradigm = Some(paradigm.clone());
                    self.emit(ClientEvent::ParadigmChanged(paradigm));
                }
                false
            }
            PushEvent::Execution(execution) => {
                apply_execution(self, &mut state, &execution);
                false
            }
            PushEvent::DebugSessionStarted { session_id, state: session_state } => {
                if state.debug.set_state(&session_id, session_state) {
                    self.emit(ClientEvent::DebugSessionsChanged);
                }
                false
            }
            PushEvent::DebugStepExecuted { session_id, result } => {
                if state.apply_debug_step(&session_id, &result, Instant::now()) {
                    self.emit(ClientEvent::DebugSessionsChanged);
                }
                false
            }
            PushEvent::DebugSessionStopped { session_id } => {
                if state.remove_debug_session(&session_id) {
                    self.emit(ClientEvent::DebugSessionsChanged);
                }
                false
            }
            PushEvent::AllSessionsCompleted { results } => {
                if state.debug.apply_run_all(&results) {
                    self.emit(ClientEvent::DebugSessionsChanged);
                }
                false
            }
        };

        if graph_changed {
            debug!(
                event = name,
                revision = state.graph.revision(),
                "push applied"
            );
            self.graph_changed(&mut state);
        }
    }

    /// Fires whatever timers are due at `now`.
    pub async fn poll_timers(&self, now: Instant) {
        let save_due = {
            let mut state = self.state.lock().await;
            state.visualizer.expire(now);
            !state.persistence.restoring && state.persistence.autosave.take_due(now)
        };
        if save_due {
            // Failure is already reported through the save status.
            let _ = self.save_now().await;
        }
    }
}

fn apply_execution(
    client: &CanvasClient,
    state: &mut CanvasState,
    execution: &shared::protocol::ExecutionEvent,
) {
    let CanvasState {
        graph, visualizer, ..
    } = state;
    if visualizer.apply(execution, graph, Instant::now()) {
        client.emit(ClientEvent::ExecutionStateChanged {
            executing: visualizer.is_executing(),
            current_node: visualizer.current_node().cloned(),
        });
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
