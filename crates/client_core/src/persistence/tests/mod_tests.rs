use std::sync::Arc;

use serde_json::json;
use shared::{
    domain::{ConnectionId, NodeIdentity},
    graph::{Node, Position, ViewportState},
};

use super::*;
use crate::{config::ClientSettings, error::SyncError, sync::MemorySyncChannel};

struct Harness {
    channel: Arc<MemorySyncChannel>,
    store: Arc<MemorySnapshotStore>,
    client: Arc<CanvasClient>,
}

fn harness() -> Harness {
    let channel = Arc::new(MemorySyncChannel::new());
    let store = Arc::new(MemorySnapshotStore::new());
    let client = CanvasClient::new(channel.clone(), store.clone(), ClientSettings::default());
    Harness {
        channel,
        store,
        client,
    }
}

fn saved_node(id: &str, x: f64, y: f64) -> Node {
    let mut node = Node::new(id, "python", Position::new(x, y));
    node.parameters.source_code = Some(format!("print('{id}')"));
    node
}

fn saved_connection(id: &str, source: &str, target: &str) -> Connection {
    Connection {
        id: ConnectionId::from(id),
        source_node_id: NodeId::from(source),
        source_port: "output".into(),
        target_node_id: NodeId::from(target),
        target_port: "input".into(),
        data_type: None,
    }
}

fn document(version: u32, body: Value) -> StoredDocument {
    StoredDocument {
        version,
        saved_at: Utc::now(),
        body,
    }
}

#[tokio::test(start_paused = true)]
async fn scheduler_is_trailing_edge() {
    let mut scheduler = AutosaveScheduler::new(Duration::from_millis(300));
    let start = Instant::now();
    scheduler.schedule(start);
    scheduler.schedule(start + Duration::from_millis(200));

    assert!(!scheduler.take_due(start + Duration::from_millis(300)));
    assert_eq!(
        scheduler.deadline(),
        Some(start + Duration::from_millis(500))
    );
    assert!(scheduler.take_due(start + Duration::from_millis(500)));
    assert!(!scheduler.is_pending());
}

#[tokio::test(start_paused = true)]
async fn rapid_mutations_produce_one_snapshot_after_the_last() {
    let h = harness();
    let identity = NodeIdentity::local_fallback();
    let node_id = identity.id().clone();
    {
        let mut state = h.client.state.lock().await;
        let node = Node::new(node_id.clone(), "python", Position::default());
        state.graph.upsert_node(node);
        state.graph.mark_local_fallback(&node_id);
    }

    for step in 1..=5 {
        h.client
            .move_node(&node_id, Position::new(step as f64 * 10.0, 0.0))
            .await
            .expect("move");
        tokio::time::advance(Duration::from_millis(50)).await;
        h.client.poll_timers(Instant::now()).await;
    }
    assert_eq!(h.client.save_status().await, SaveStatus::Saving);

    tokio::time::advance(Duration::from_millis(240)).await;
    h.client.poll_timers(Instant::now()).await;
    assert_eq!(h.store.save_count(CANVAS_STATE_KEY).await, 0);

    tokio::time::advance(Duration::from_millis(10)).await;
    h.client.poll_timers(Instant::now()).await;
    assert_eq!(h.store.save_count(CANVAS_STATE_KEY).await, 1);
    assert_eq!(h.client.save_status().await, SaveStatus::Saved);

    let saved = load_snapshot(h.store.as_ref())
        .await
        .expect("load")
        .expect("snapshot present");
    assert_eq!(saved.nodes[0].position, Position::new(50.0, 0.0));
    assert_eq!(h.channel.call_count("move_node").await, 0);
}

#[tokio::test]
async fn restore_remaps_ids_and_skips_dangling_connections() {
    let h = harness();
    let snapshot = CanvasSnapshot {
        nodes: vec![saved_node("old-a", 0.0, 0.0), saved_node("old-b", 300.0, 0.0)],
        connections: vec![
            saved_connection("c1", "old-a", "old-b"),
            saved_connection("c2", "old-a", "ghost"),
        ],
        viewport: ViewportState {
            zoom: 2.0,
            pan_x: -40.0,
            pan_y: 15.0,
        },
    };

    let report = h.client.restore_snapshot(snapshot).await;

    assert_eq!(
        report,
        RestoreReport {
            nodes_replayed: 2,
            nodes_local: 0,
            connections_replayed: 1,
            connections_local: 0,
            connections_skipped: 1,
            remote_cleared: true,
            saved: true,
        }
    );
    h.client
        .read(|state| {
            assert_eq!(state.graph.node_count(), 2);
            assert!(state.graph.node(&NodeId::from("old-a")).is_none());
            let connection = state.graph.connections().next().expect("one connection");
            assert_eq!(connection.source_node_id, NodeId::from("node-1"));
            assert_eq!(connection.target_node_id, NodeId::from("node-2"));
            assert_eq!(state.viewport.zoom(), 2.0);
            assert_eq!(state.viewport.pan(), (-40.0, 15.0));
            assert!(!state.persistence.restoring);
        })
        .await;
    assert_eq!(h.channel.connections().await.len(), 1);
    assert_eq!(h.store.save_count(CANVAS_STATE_KEY).await, 1);
}

#[tokio::test]
async fn failed_connection_replay_keeps_a_local_copy_and_continues() {
    let h = harness();
    h.channel
        .fail_call(
            "create_connection",
            0,
            SyncError::Transport("connection reset".into()),
        )
        .await;
    let snapshot = CanvasSnapshot {
        nodes: vec![
            saved_node("a", 0.0, 0.0),
            saved_node("b", 300.0, 0.0),
            saved_node("c", 600.0, 0.0),
        ],
        connections: vec![saved_connection("ab", "a", "b"), saved_connection("bc", "b", "c")],
        viewport: ViewportState::default(),
    };

    let report = h.client.restore_snapshot(snapshot).await;

    assert_eq!(report.nodes_replayed, 3);
    assert_eq!(report.connections_local, 1);
    assert_eq!(report.connections_replayed, 1);
    assert_eq!(report.connections_skipped, 0);
    assert_eq!(h.channel.call_count("create_connection").await, 2);
    assert_eq!(h.channel.connections().await.len(), 1);
    h.client
        .read(|state| {
            assert_eq!(state.graph.connection_count(), 2);
            let local: Vec<_> = state
                .graph
                .connections()
                .filter(|connection| state.graph.is_local_connection(&connection.id))
                .collect();
            assert_eq!(local.len(), 1);
            assert_eq!(local[0].source_node_id, NodeId::from("node-1"));
            assert_eq!(local[0].target_node_id, NodeId::from("node-2"));
        })
        .await;
}

#[tokio::test]
async fn rejected_node_replay_degrades_to_a_local_copy() {
    let h = harness();
    h.channel
        .fail_call(
            "create_node",
            1,
            SyncError::Transport("connection reset".into()),
        )
        .await;
    let mut events = h.client.subscribe_events();
    let snapshot = CanvasSnapshot {
        nodes: vec![saved_node("a", 0.0, 0.0), saved_node("b", 300.0, 0.0)],
        connections: vec![saved_connection("ab", "a", "b")],
        viewport: ViewportState::default(),
    };

    let report = h.client.restore_snapshot(snapshot).await;

    assert_eq!(report.nodes_replayed, 1);
    assert_eq!(report.nodes_local, 1);
    assert_eq!(report.connections_local, 1);
    assert_eq!(h.channel.call_count("create_connection").await, 0);
    h.client
        .read(|state| {
            let local: Vec<_> = state.graph.local_fallback_ids().collect();
            assert_eq!(local.len(), 1);
            assert!(local[0].as_str().starts_with("local-"));
            let connection = state.graph.connections().next().expect("local connection");
            assert!(state.graph.is_local_connection(&connection.id));
            assert_eq!(&connection.target_node_id, local[0]);
        })
        .await;

    let mut warned = false;
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Notification { level, .. } = event {
            warned |= level == NotificationLevel::Warning;
        }
    }
    assert!(warned);
}

#[tokio::test]
async fn restore_goes_on_when_the_remote_clear_fails() {
    let h = harness();
    h.channel
        .fail_always("clear_canvas", SyncError::Transport("offline".into()))
        .await;

    let report = h
        .client
        .restore_snapshot(CanvasSnapshot {
            nodes: vec![saved_node("a", 0.0, 0.0)],
            ..CanvasSnapshot::default()
        })
        .await;

    assert!(!report.remote_cleared);
    assert_eq!(report.nodes_replayed, 1);
}

#[tokio::test]
async fn import_normalizes_object_positions() {
    let h = harness();
    let raw = json!({
        "project": {"name": "Imported", "saved_at": "2024-01-01T00:00:00Z"},
        "state": {
            "nodes": [{"id": "n1", "type": "python", "position": {"x": 10, "y": 20}}],
            "connections": [],
        },
        "engine_tabs": [{"engine": "python"}],
    })
    .to_string();

    let report = h.client.import_document(&raw).await.expect("import");

    assert_eq!(report.nodes_replayed, 1);
    h.client
        .read(|state| {
            let node = state.graph.nodes().next().expect("node");
            assert_eq!(node.position, Position::new(10.0, 20.0));
            assert_eq!(state.persistence.project_name, "Imported");
        })
        .await;
    assert_eq!(
        h.channel.nodes().await[0].position,
        Position::new(10.0, 20.0)
    );

    let exported = h.client.export_document().await;
    assert_eq!(exported.project.name, "Imported");
    assert_eq!(exported.engine_tabs, vec![json!({"engine": "python"})]);
}

#[tokio::test]
async fn import_rejects_documents_without_nodes() {
    let h = harness();
    let err = h
        .client
        .import_document(r#"{"hello": "world"}"#)
        .await
        .expect_err("not a project");
    assert!(matches!(
        err,
        ClientError::Persistence(PersistenceError::UnrecognizedDocument(_))
    ));
    assert_eq!(h.channel.call_count("clear_canvas").await, 0);
}

#[tokio::test]
async fn export_bundles_project_state_and_tabs() {
    let h = harness();
    {
        let mut state = h.client.state.lock().await;
        state.graph.upsert_node(saved_node("a", 1.0, 2.0));
        state.persistence.project_name = "Demo".into();
    }

    let exported: Value =
        serde_json::from_str(&h.client.export_json().await.expect("export")).expect("json");

    assert_eq!(exported["project"]["name"], json!("Demo"));
    assert!(exported["project"]["saved_at"].is_string());
    assert_eq!(exported["state"]["nodes"][0]["position"], json!([1.0, 2.0]));
    assert_eq!(exported["state"]["connections"], json!([]));
    assert_eq!(exported["state"]["viewport"]["zoom"], json!(1.0));
    assert_eq!(exported["engine_tabs"], json!([]));
}

#[tokio::test]
async fn documents_with_another_version_are_ignored() {
    let h = harness();
    let snapshot = CanvasSnapshot {
        nodes: vec![saved_node("a", 0.0, 0.0)],
        ..CanvasSnapshot::default()
    };
    h.store
        .insert(
            CANVAS_STATE_KEY,
            document(99, serde_json::to_value(&snapshot).expect("encode")),
        )
        .await;

    let restored = h.client.restore_saved_canvas().await.expect("restore");
    assert!(restored.is_none());
    assert_eq!(h.channel.call_count("clear_canvas").await, 0);
}

#[tokio::test]
async fn empty_saved_canvas_keeps_backend_state() {
    let h = harness();
    h.store
        .insert(
            CANVAS_STATE_KEY,
            document(
                CANVAS_STATE_VERSION,
                serde_json::to_value(CanvasSnapshot::default()).expect("encode"),
            ),
        )
        .await;

    let restored = h.client.restore_saved_canvas().await.expect("restore");
    assert!(restored.is_none());
    assert_eq!(h.channel.call_count("clear_canvas").await, 0);
}

#[tokio::test]
async fn legacy_saved_body_is_normalized_before_restore() {
    let h = harness();
    h.store
        .insert(
            CANVAS_STATE_KEY,
            document(
                CANVAS_STATE_VERSION,
                json!({
                    "nodes": {"old": {"type": "python", "position": {"x": 5, "y": 6}}},
                    "connections": [],
                }),
            ),
        )
        .await;
    h.store
        .insert(
            PROJECT_META_KEY,
            document(
                PROJECT_META_VERSION,
                json!({"name": "Saved Project", "saved_at": "2024-05-01T10:00:00Z"}),
            ),
        )
        .await;

    let report = h
        .client
        .restore_saved_canvas()
        .await
        .expect("restore")
        .expect("something restored");

    assert_eq!(report.nodes_replayed, 1);
    h.client
        .read(|state| {
            assert_eq!(state.persistence.project_name, "Saved Project");
            assert_eq!(
                state.graph.nodes().next().expect("node").position,
                Position::new(5.0, 6.0)
            );
        })
        .await;
}

#[tokio::test]
async fn failed_save_reports_failure_status() {
    let h = harness();
    h.store.set_fail_saves(true).await;
    let mut events = h.client.subscribe_events();

    assert!(h.client.save_now().await.is_err());
    assert_eq!(h.client.save_status().await, SaveStatus::Failed);
    assert_eq!(SaveStatus::Failed.label(), "Save failed");

    let statuses: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            ClientEvent::SaveStatusChanged(status) => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![SaveStatus::Saving, SaveStatus::Failed]);
}

#[tokio::test]
async fn ui_settings_round_trip_through_the_store() {
    let h = harness();
    let defaults = h.client.load_ui_settings().await.expect("defaults");
    assert_eq!(defaults, UiSettings::default());

    let tuned = UiSettings {
        execution_speed: 4.0,
        highlight_duration_ms: 500,
        snap_to_grid: true,
        ..UiSettings::default()
    };
    h.client
        .save_ui_settings(tuned.clone())
        .await
        .expect("save");

    let other = CanvasClient::new(
        h.channel.clone(),
        h.store.clone(),
        ClientSettings::default(),
    );
    assert_eq!(other.load_ui_settings().await.expect("load"), tuned);
    assert_eq!(
        other.read(|state| state.visualizer.execution_speed()).await,
        4.0
    );
}

#[tokio::test]
async fn reset_removes_every_document() {
    let h = harness();
    h.client.save_now().await.expect("save");

    let removed = reset_documents(h.store.as_ref()).await.expect("reset");
    assert_eq!(removed, vec![CANVAS_STATE_KEY, PROJECT_META_KEY]);
    assert!(h.store.document(CANVAS_STATE_KEY).await.is_none());
}
