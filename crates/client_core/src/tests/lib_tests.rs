use serde_json::json;
use shared::{
    error::ErrorCode,
    graph::{Node, Port},
    protocol::PushEvent,
};
use tokio::sync::mpsc;

use super::*;
use crate::{persistence::MemorySnapshotStore, sync::MemorySyncChannel};

struct Harness {
    channel: Arc<MemorySyncChannel>,
    client: Arc<CanvasClient>,
    pushes: mpsc::UnboundedReceiver<PushEvent>,
}

impl Harness {
    async fn new() -> Self {
        let channel = Arc::new(MemorySyncChannel::new());
        let pushes = channel.subscribe_pushes().await;
        let client = CanvasClient::new(
            channel.clone(),
            Arc::new(MemorySnapshotStore::new()),
            ClientSettings::default(),
        );
        Self {
            channel,
            client,
            pushes,
        }
    }

    /// Applies every push the backend has echoed so far.
    async fn drain(&mut self) {
        while let Ok(event) = self.pushes.try_recv() {
            self.client.apply_push(event).await;
        }
    }

    async fn seed(&mut self, id: &str, x: f64) {
        let mut node = Node::new(id, "python", Position::new(x, 0.0));
        node.parameters.source_code = Some(format!("{id}()"));
        self.channel.seed_node(node.clone()).await;
        self.client.apply_push(PushEvent::NodeAdded { node }).await;
    }

    async fn seed_local(&mut self, x: f64) -> NodeId {
        let node_id = NodeIdentity::local_fallback().into_id();
        let mut state = self.client.state.lock().await;
        state
            .graph
            .upsert_node(Node::new(node_id.clone(), "python", Position::new(x, 0.0)));
        state.graph.mark_local_fallback(&node_id);
        node_id
    }
}

fn notifications(
    events: &mut broadcast::Receiver<ClientEvent>,
) -> Vec<(NotificationLevel, String)> {
    std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            ClientEvent::Notification { level, message } => Some((level, message)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn created_nodes_connect_and_removal_cascades() {
    let mut h = Harness::new().await;

    let a = h
        .client
        .create_node("python", Position::new(0.0, 0.0))
        .await
        .expect("create a");
    let b = h
        .client
        .create_node("python", Position::new(300.0, 0.0))
        .await
        .expect("create b");
    assert_eq!(h.client.read(|state| state.graph.node_count()).await, 0);
    h.drain().await;

    h.client
        .connect(&a, "output", &b, "input")
        .await
        .expect("connect");
    h.drain().await;
    assert_eq!(
        h.client.read(|state| state.graph.connection_count()).await,
        1
    );

    h.client.delete_node(&a).await.expect("delete a");
    h.drain().await;

    h.client
        .read(|state| {
            let ids: Vec<&NodeId> = state.graph.nodes().map(|node| &node.id).collect();
            assert_eq!(ids, vec![&b]);
            assert_eq!(state.graph.connection_count(), 0);
        })
        .await;
    assert!(h.channel.connections().await.is_empty());
}

#[tokio::test]
async fn rejected_move_leaves_the_node_and_notifies() {
    let mut h = Harness::new().await;
    h.client
        .apply_push(PushEvent::NodeAdded {
            node: Node::new("orphan", "python", Position::new(1.0, 1.0)),
        })
        .await;
    let mut events = h.client.subscribe_events();

    let err = h
        .client
        .move_node(&NodeId::from("orphan"), Position::new(50.0, 50.0))
        .await
        .expect_err("backend does not know the node");
    assert!(matches!(
        err,
        ClientError::Sync(SyncError::Rejected(ref api)) if api.code == ErrorCode::NotFound
    ));

    let orphan = NodeId::from("orphan");
    let position = h
        .client
        .read(|state| state.graph.node(&orphan).map(|node| node.position))
        .await;
    assert_eq!(position, Some(Position::new(1.0, 1.0)));
    let notes = notifications(&mut events);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].0, NotificationLevel::Error);
    h.drain().await;
}

#[tokio::test]
async fn confirmed_move_applies_without_waiting_for_the_push() {
    let mut h = Harness::new().await;
    h.seed("a", 0.0).await;

    h.client
        .move_node(&NodeId::from("a"), Position::new(75.0, 25.0))
        .await
        .expect("move");
    let a = NodeId::from("a");
    let moved = h
        .client
        .read(|state| state.graph.node(&a).map(|node| node.position))
        .await;
    assert_eq!(moved, Some(Position::new(75.0, 25.0)));

    let revision = h.client.read(|state| state.graph.revision()).await;
    h.drain().await;
    assert_eq!(
        h.client.read(|state| state.graph.revision()).await,
        revision
    );
}

#[tokio::test]
async fn self_loops_are_refused_before_reaching_the_backend() {
    let mut h = Harness::new().await;
    h.seed("a", 0.0).await;

    let err = h
        .client
        .connect(&NodeId::from("a"), "output", &NodeId::from("a"), "input")
        .await
        .expect_err("self loop");
    assert!(matches!(err, ClientError::Graph(GraphError::SelfLoop { .. })));
    assert_eq!(h.channel.call_count("create_connection").await, 0);
}

#[tokio::test]
async fn connecting_unknown_nodes_fails_locally() {
    let mut h = Harness::new().await;
    h.seed("a", 0.0).await;

    let err = h
        .client
        .connect(
            &NodeId::from("a"),
            "output",
            &NodeId::from("ghost"),
            "input",
        )
        .await
        .expect_err("unknown target");
    assert!(matches!(err, ClientError::UnknownNode(ref id) if id.as_str() == "ghost"));

    let err = h
        .client
        .disconnect(&ConnectionId::from("nope"))
        .await
        .expect_err("unknown connection");
    assert!(matches!(err, ClientError::UnknownConnection(_)));
}

#[tokio::test]
async fn local_only_nodes_never_reach_the_backend() {
    let mut h = Harness::new().await;
    h.seed("a", 0.0).await;
    let local = h.seed_local(300.0).await;

    let connection_id = h
        .client
        .connect(&NodeId::from("a"), "output", &local, "input")
        .await
        .expect("local connection");
    h.client
        .move_node(&local, Position::new(400.0, 10.0))
        .await
        .expect("local move");
    let parameters = json!({"name": "scratch"})
        .as_object()
        .cloned()
        .unwrap_or_default();
    h.client
        .update_node_parameters(&local, parameters)
        .await
        .expect("local parameters");

    h.client
        .read(|state| {
            assert!(state.graph.is_local_connection(&connection_id));
            let node = state.graph.node(&local).expect("local node");
            assert_eq!(node.position, Position::new(400.0, 10.0));
            assert_eq!(node.parameters.name.as_deref(), Some("scratch"));
        })
        .await;

    h.client
        .disconnect(&connection_id)
        .await
        .expect("disconnect");
    h.client.delete_node(&local).await.expect("delete");
    for operation in [
        "create_connection",
        "delete_connection",
        "move_node",
        "update_node_parameters",
        "delete_node",
    ] {
        assert_eq!(h.channel.call_count(operation).await, 0, "{operation}");
    }
    assert_eq!(h.client.read(|state| state.graph.node_count()).await, 1);
}

#[tokio::test]
async fn parameter_and_metadata_updates_merge_on_the_backend() {
    let mut h = Harness::new().await;
    h.seed("a", 0.0).await;
    let id = NodeId::from("a");

    let mut partial = Map::new();
    partial.insert("name".into(), json!("loader"));
    h.client
        .update_node_parameters(&id, partial)
        .await
        .expect("parameters");
    let mut meta = Map::new();
    meta.insert("description".into(), json!("reads rows"));
    h.client
        .update_node_metadata(&id, meta)
        .await
        .expect("metadata");
    h.client
        .update_node_ports(
            &id,
            PortsUpdate {
                inputs: vec![Port::new("path", "str")],
                outputs: vec![Port::new("rows", "list")],
            },
        )
        .await
        .expect("ports");
    h.drain().await;

    h.client
        .read(|state| {
            let node = state.graph.node(&id).expect("node");
            assert_eq!(node.parameters.name.as_deref(), Some("loader"));
            assert_eq!(node.parameters.source_code.as_deref(), Some("a()"));
            assert_eq!(node.metadata.description.as_deref(), Some("reads rows"));
            assert_eq!(node.inputs[0].name, "path");
            assert_eq!(node.outputs[0].port_type, "list");
        })
        .await;
}

#[tokio::test]
async fn clearing_requires_confirmation_and_backend_success() {
    let mut h = Harness::new().await;
    h.seed("a", 0.0).await;
    h.channel
        .fail_call("clear_canvas", 0, SyncError::Transport("timeout".into()))
        .await;

    let cleared = h
        .client
        .clear_canvas(ClearConfirmation::acknowledge_data_loss())
        .await;
    assert!(cleared.is_err());
    assert_eq!(h.client.read(|state| state.graph.node_count()).await, 1);

    h.client
        .clear_canvas(ClearConfirmation::acknowledge_data_loss())
        .await
        .expect("clear");
    h.drain().await;
    assert!(h.client.read(|state| state.graph.is_empty()).await);
    assert!(h.channel.nodes().await.is_empty());
}

#[tokio::test]
async fn anchored_zoom_keeps_the_point_under_the_cursor() {
    let mut h = Harness::new().await;
    let before = h
        .client
        .read(|state| state.viewport.screen_to_canvas(100.0, 100.0))
        .await;

    assert!(h.client.set_zoom(2.0, Some((100.0, 100.0))).await);
    assert!(!h.client.set_zoom(2.0, Some((100.0, 100.0))).await);
    h.drain().await;

    let viewport = h.client.viewport().await;
    assert_eq!(viewport.zoom, 2.0);
    assert_eq!((viewport.pan_x, viewport.pan_y), (-100.0, -100.0));
    let after = h
        .client
        .read(|state| state.viewport.screen_to_canvas(100.0, 100.0))
        .await;
    assert_eq!(before, after);
    assert_eq!(h.channel.call_count("set_viewport_zoom").await, 1);
    assert_eq!(h.client.save_status().await, SaveStatus::Saving);
}

#[tokio::test]
async fn unanchored_zoom_and_pan_stay_in_step_with_the_backend() {
    let mut h = Harness::new().await;
    assert!(h.client.pan_by(30.0, 40.0).await);
    assert!(h.client.set_zoom(2.0, None).await);
    h.drain().await;

    let viewport = h.client.viewport().await;
    assert_eq!(viewport.zoom, 2.0);
    assert_eq!((viewport.pan_x, viewport.pan_y), (30.0, 40.0));
}

#[tokio::test]
async fn viewport_failures_do_not_undo_local_changes() {
    let h = Harness::new().await;
    h.channel
        .fail_always("pan_viewport", SyncError::Transport("down".into()))
        .await;

    assert!(h.client.pan_by(5.0, 0.0).await);
    assert_eq!(h.client.viewport().await.pan_x, 5.0);
}

#[tokio::test]
async fn fit_frames_every_node() {
    let mut h = Harness::new().await;
    h.seed("a", 0.0).await;
    h.seed("b", 1000.0).await;
    h.client.set_surface_size(800.0, 600.0).await;

    assert!(h.client.fit_to_content().await);
    let fitted = h.client.viewport().await;
    h.drain().await;

    assert_eq!(h.client.viewport().await, fitted);
    let visible = h
        .client
        .read(|state| state.viewport.visible_canvas_rect())
        .await;
    assert!(visible.contains(Position::new(0.0, 0.0)));
    assert!(visible.contains(Position::new(1200.0, 50.0)));
}

#[tokio::test]
async fn bulk_load_replaces_state_without_scheduling_a_save() {
    let h = Harness::new().await;
    h.channel
        .seed_node(Node::new("remote", "python", Position::new(3.0, 4.0)))
        .await;

    h.client.load_from_backend().await.expect("load");

    let remote = NodeId::from("remote");
    let loaded = h
        .client
        .read(|state| state.graph.contains_node(&remote))
        .await;
    assert!(loaded);
    assert_eq!(h.client.save_status().await, SaveStatus::Idle);
}

#[tokio::test]
async fn paradigm_switch_is_announced_once() {
    let mut h = Harness::new().await;
    let mut events = h.client.subscribe_events();

    h.client
        .set_active_paradigm("dataflow")
        .await
        .expect("switch");
    h.drain().await;

    let announced: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| matches!(event, ClientEvent::ParadigmChanged(_)))
        .collect();
    assert_eq!(
        announced,
        vec![ClientEvent::ParadigmChanged("dataflow".into())]
    );
}

#[tokio::test]
async fn stopping_execution_resets_the_overlay() {
    let mut h = Harness::new().await;
    h.seed("a", 0.0).await;
    h.client
        .start_execution(ExecutionMode::Normal)
        .await
        .expect("start");
    h.client
        .apply_push(PushEvent::Execution(shared::protocol::ExecutionEvent::for_node(
            shared::protocol::ExecutionEventType::NodeStart,
            "a",
        )))
        .await;
    assert!(h.client.read(|state| state.visualizer.is_executing()).await);

    h.client.stop_execution().await.expect("stop");
    h.client
        .read(|state| {
            assert!(!state.visualizer.is_executing());
            assert_eq!(state.visualizer.highlights().count(), 0);
        })
        .await;
}

#[tokio::test]
async fn code_services_see_the_current_graph() {
    let mut h = Harness::new().await;
    h.seed("load", 0.0).await;
    h.seed("save", 300.0).await;

    let found = h
        .client
        .pattern_search("load", "python")
        .await
        .expect("search");
    assert_eq!(found["matches"].as_array().map(Vec::len), Some(1));

    let exported = h
        .client
        .export_code("python", Map::new())
        .await
        .expect("export");
    assert_eq!(exported["code"], json!("load()\n\nsave()"));

    h.client
        .pattern_refactor(PatternRefactorRequest {
            search_pattern: "save".into(),
            replace_pattern: "persist".into(),
            language: "python".into(),
            node_ids: None,
            apply: true,
        })
        .await
        .expect("refactor");
    h.drain().await;
    let code = h
        .client
        .read(|state| {
            state
                .graph
                .node(&NodeId::from("save"))
                .and_then(|node| node.parameters.source_code.clone())
        })
        .await;
    assert_eq!(code.as_deref(), Some("persist()"));
}
