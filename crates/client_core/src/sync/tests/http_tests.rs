use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use shared::domain::DebugSessionState;
use tokio::{net::TcpListener, sync::Mutex};

use super::*;

#[derive(Clone, Default)]
struct ServerState {
    bodies: Arc<Mutex<Vec<(String, Value)>>>,
}

async fn record_create_node(
    State(state): State<ServerState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.bodies.lock().await.push(("create_node".into(), body));
    Json(json!({"success": true, "data": {"node_id": "node-42"}}))
}

async fn move_missing_node(Path(node_id): Path<String>) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": format!("node {node_id} not found")})),
    )
}

async fn delete_node_bare_ack(
    State(state): State<ServerState>,
    Path(node_id): Path<String>,
) -> Json<Value> {
    state
        .bodies
        .lock()
        .await
        .push(("delete_node".into(), json!({ "node_id": node_id })));
    Json(json!({"success": true}))
}

async fn list_nodes() -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "n1": {
                "id": "n1",
                "type": "python",
                "position": [10, 20],
                "parameters": {"name": "load"}
            },
            "n2": {"type": "javascript", "position": {"x": 1, "y": 2}, "inputs": []}
        }
    }))
}

async fn list_connections() -> Json<Value> {
    Json(json!({
        "success": true,
        "data": [{
            "id": "c1",
            "source_node_id": "n1",
            "source_port": "output",
            "target_node_id": "n2",
            "target_port": "input",
            "data_type": "None"
        }]
    }))
}

async fn viewport() -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {"zoom": 1.5, "pan_x": -20.0, "pan_y": 4.0, "width": 800, "height": 600}
    }))
}

async fn create_session(State(state): State<ServerState>, Json(body): Json<Value>) -> Json<Value> {
    let session_id = body["session_id"].clone();
    state
        .bodies
        .lock()
        .await
        .push(("create_session".into(), body));
    Json(json!({"success": true, "session_id": session_id, "state": "created", "node_count": 1}))
}

async fn step_session(Path(session_id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "success": true,
        "session_id": session_id,
        "result": {
            "status": "stepped",
            "node_id": "n1",
            "result": body["step_type"],
            "variables": {"x": 1}
        }
    }))
}

async fn broken_html() -> impl IntoResponse {
    (StatusCode::BAD_GATEWAY, "<html>upstream down</html>")
}

async fn garbage_ok() -> impl IntoResponse {
    (StatusCode::OK, "not json")
}

async fn spawn_backend() -> anyhow::Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/api/canvas/nodes",
            get(list_nodes).post(record_create_node),
        )
        .route("/api/canvas/nodes/:node_id", delete(delete_node_bare_ack))
        .route("/api/canvas/nodes/:node_id/move", post(move_missing_node))
        .route("/api/canvas/connections", get(list_connections))
        .route("/api/canvas/viewport", get(viewport))
        .route("/api/canvas/clear", post(broken_html))
        .route("/api/execution/step", post(garbage_ok))
        .route("/api/execution/multi-debug/create", post(create_session))
        .route(
            "/api/execution/multi-debug/step/:session_id",
            post(step_session),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

#[tokio::test]
async fn create_node_sends_type_and_pair_position() {
    let (base_url, state) = spawn_backend().await.expect("spawn backend");
    let channel = HttpSyncChannel::new(format!("{base_url}/"));

    let node_id = channel
        .create_node(&CreateNodeRequest::new("python", Position::new(12.0, 34.0)))
        .await
        .expect("create node");

    assert_eq!(node_id, NodeId::from("node-42"));
    let bodies = state.bodies.lock().await;
    let (_, body) = bodies.first().expect("recorded body");
    assert_eq!(body["type"], json!("python"));
    assert_eq!(body["position"], json!([12.0, 34.0]));
}

#[tokio::test]
async fn success_false_is_a_rejection_with_status_code() {
    let (base_url, _) = spawn_backend().await.expect("spawn backend");
    let channel = HttpSyncChannel::new(base_url);

    let err = channel
        .move_node(&NodeId::from("ghost"), Position::new(0.0, 0.0))
        .await
        .expect_err("missing node");

    match err {
        SyncError::Rejected(api) => {
            assert!(api.is_not_found());
            assert!(api.message.contains("ghost"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn bare_success_envelope_acknowledges_a_delete() {
    let (base_url, state) = spawn_backend().await.expect("spawn backend");
    let channel = HttpSyncChannel::new(base_url);

    channel
        .delete_node(&NodeId::from("n9"))
        .await
        .expect("delete accepted");

    let bodies = state.bodies.lock().await;
    assert_eq!(
        bodies.as_slice(),
        &[("delete_node".to_string(), json!({"node_id": "n9"}))]
    );
}

#[tokio::test]
async fn non_envelope_error_pages_are_transport_failures() {
    let (base_url, _) = spawn_backend().await.expect("spawn backend");
    let channel = HttpSyncChannel::new(base_url);

    let err = channel.clear_canvas().await.expect_err("bad gateway");
    assert!(matches!(err, SyncError::Transport(_)));
}

#[tokio::test]
async fn unparseable_success_is_malformed() {
    let (base_url, _) = spawn_backend().await.expect("spawn backend");
    let channel = HttpSyncChannel::new(base_url);

    let err = channel.step_execution().await.expect_err("garbage");
    assert!(matches!(err, SyncError::Malformed(_)));
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_failure() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let channel = HttpSyncChannel::new(format!("http://{addr}"));
    let err = channel.fetch_canvas().await.expect_err("refused");
    assert!(matches!(err, SyncError::Transport(_)));
}

#[tokio::test]
async fn fetch_canvas_normalizes_the_bulk_load() {
    let (base_url, _) = spawn_backend().await.expect("spawn backend");
    let channel = HttpSyncChannel::new(base_url);

    let load = channel.fetch_canvas().await.expect("fetch");

    assert_eq!(load.nodes.len(), 2);
    assert_eq!(load.nodes[0].id, NodeId::from("n1"));
    assert_eq!(load.nodes[0].parameters.name.as_deref(), Some("load"));
    assert_eq!(load.nodes[1].id, NodeId::from("n2"));
    assert_eq!(load.nodes[1].position, Position::new(1.0, 2.0));
    assert!(load.nodes[1].inputs.is_empty());
    assert_eq!(load.connections.len(), 1);
    assert!(load.connections[0].data_type.is_none());
    assert_eq!(load.viewport.zoom, 1.5);
    assert_eq!(load.viewport.pan_x, -20.0);
}

#[tokio::test]
async fn debug_routes_read_top_level_fields() {
    let (base_url, state) = spawn_backend().await.expect("spawn backend");
    let channel = HttpSyncChannel::new(base_url);
    let session_id = SessionId::from("session-a");

    let ack = channel
        .create_debug_session(&CreateDebugSessionRequest {
            session_id: session_id.clone(),
            nodes: vec![shared::protocol::DebugNodeSpec {
                id: NodeId::from("n1"),
                code_snippet: "x = 1".into(),
                node_type: "python".into(),
            }],
            options: Map::new(),
        })
        .await
        .expect("create session");
    assert_eq!(ack.session_id, session_id);
    assert_eq!(ack.state, DebugSessionState::Created);

    let step = channel
        .step_debug_session(&session_id, StepType::Over)
        .await
        .expect("step");
    assert_eq!(step.result.node_id, Some(NodeId::from("n1")));
    assert_eq!(step.result.result, json!("over"));
    assert_eq!(step.result.variables.get("x"), Some(&json!(1)));

    let bodies = state.bodies.lock().await;
    let (_, body) = bodies
        .iter()
        .find(|(name, _)| name == "create_session")
        .expect("create body");
    assert_eq!(body["nodes"][0]["type"], json!("python"));
    assert_eq!(body["nodes"][0]["code_snippet"], json!("x = 1"));
}
