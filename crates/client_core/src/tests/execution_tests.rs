use serde_json::{json, Map};
use shared::graph::{Connection, Node};

use super::*;

const HIGHLIGHT: Duration = Duration::from_millis(1500);
const FLOW: Duration = Duration::from_millis(800);

fn visualizer() -> ExecutionVisualizer {
    ExecutionVisualizer::new(HIGHLIGHT, FLOW, 50)
}

fn graph_with_edge() -> GraphStore {
    let mut graph = GraphStore::new();
    graph.upsert_node(Node::new("a", "python", Position::new(0.0, 0.0)));
    graph.upsert_node(Node::new("b", "python", Position::new(400.0, 0.0)));
    graph
        .upsert_connection(Connection {
            id: ConnectionId::from("ab"),
            source_node_id: NodeId::from("a"),
            source_port: "output".into(),
            target_node_id: NodeId::from("b"),
            target_port: "input".into(),
            data_type: None,
        })
        .expect("edge");
    graph
}

fn started(node: &str) -> ExecutionEvent {
    ExecutionEvent::for_node(ExecutionEventType::NodeStart, node)
}

fn completed(node: &str) -> ExecutionEvent {
    ExecutionEvent::for_node(ExecutionEventType::NodeComplete, node)
}

fn with_data(mut event: ExecutionEvent, data: Value) -> ExecutionEvent {
    if let Value::Object(map) = data {
        event.data = Some(map);
    } else {
        event.data = Some(Map::new());
    }
    event
}

#[test]
fn node_lifecycle_moves_through_executing_and_completed() {
    let graph = GraphStore::new();
    let mut viz = visualizer();
    let now = Instant::now();
    let node = NodeId::from("a");

    assert!(viz.apply(&started("a"), &graph, now));
    assert!(viz.is_executing());
    assert_eq!(viz.current_node(), Some(&node));
    assert_eq!(
        viz.highlight(&node).expect("highlight").state,
        HighlightState::Executing
    );

    let complete = with_data(completed("a"), json!({"execution_time": 0.25}));
    viz.apply(&complete, &graph, now + Duration::from_millis(100));
    assert_eq!(viz.current_node(), None);
    assert_eq!(
        viz.highlight(&node).expect("highlight").state,
        HighlightState::Completed {
            elapsed: Some(Duration::from_millis(250))
        }
    );
}

#[test]
fn highlights_expire_and_errors_last_twice_as_long() {
    let graph = GraphStore::new();
    let mut viz = visualizer();
    let now = Instant::now();

    viz.apply(&completed("ok"), &graph, now);
    let mut error = ExecutionEvent::for_node(ExecutionEventType::NodeError, "bad");
    error.message = Some("ZeroDivisionError".into());
    viz.apply(&error, &graph, now);

    assert_eq!(viz.next_deadline(), Some(now + HIGHLIGHT));
    assert!(viz.expire(now + HIGHLIGHT));
    assert!(viz.highlight(&NodeId::from("ok")).is_none());
    let bad = NodeId::from("bad");
    assert_eq!(
        viz.highlight(&bad).expect("error still shown").state,
        HighlightState::Error {
            message: "ZeroDivisionError".into()
        }
    );

    viz.expire(now + HIGHLIGHT * 2);
    assert!(viz.highlight(&NodeId::from("bad")).is_none());
}

#[test]
fn a_new_event_replaces_the_pending_expiry() {
    let graph = GraphStore::new();
    let mut viz = visualizer();
    let now = Instant::now();

    viz.apply(&started("a"), &graph, now);
    let later = now + Duration::from_millis(1000);
    viz.apply(&completed("a"), &graph, later);

    viz.expire(now + HIGHLIGHT);
    assert!(viz.highlight(&NodeId::from("a")).is_some());
    viz.expire(later + HIGHLIGHT);
    assert!(viz.highlight(&NodeId::from("a")).is_none());
}

#[test]
fn data_flow_markers_travel_between_node_centers() {
    let graph = graph_with_edge();
    let mut viz = visualizer();
    viz.set_execution_speed(2.0);
    let now = Instant::now();

    let mut flow = ExecutionEvent::new(ExecutionEventType::DataFlow);
    flow.connection_id = Some(ConnectionId::from("ab"));
    viz.apply(&flow, &graph, now);

    let from = graph.node_center(&NodeId::from("a")).expect("a center");
    let to = graph.node_center(&NodeId::from("b")).expect("b center");
    let halfway = viz.markers(now + Duration::from_millis(200));
    assert_eq!(halfway.len(), 1);
    assert_eq!(halfway[0].1, from.lerp(to, 0.5));

    assert!(viz.markers(now + Duration::from_millis(400)).is_empty());
    assert!(viz.expire(now + Duration::from_millis(400)));
}

#[test]
fn data_flow_falls_back_to_payload_endpoints() {
    let graph = graph_with_edge();
    let mut viz = visualizer();
    let now = Instant::now();

    let flow = with_data(
        ExecutionEvent::new(ExecutionEventType::DataFlow),
        json!({"source_node": "b", "target_node": "a"}),
    );
    viz.apply(&flow, &graph, now);
    assert_eq!(viz.markers(now).len(), 1);

    let missing = with_data(
        ExecutionEvent::new(ExecutionEventType::DataFlow),
        json!({"source_node": "b", "target_node": "ghost"}),
    );
    viz.apply(&missing, &graph, now);
    assert_eq!(viz.markers(now).len(), 1);
}

#[test]
fn execution_complete_clears_everything_including_the_log() {
    let graph = graph_with_edge();
    let mut viz = visualizer();
    let now = Instant::now();

    viz.apply(&started("a"), &graph, now);
    let mut flow = ExecutionEvent::new(ExecutionEventType::DataFlow);
    flow.connection_id = Some(ConnectionId::from("ab"));
    viz.apply(&flow, &graph, now);
    assert_eq!(viz.log().count(), 2);

    let finished = ExecutionEvent::new(ExecutionEventType::ExecutionComplete);
    assert!(viz.apply(&finished, &graph, now));
    assert!(!viz.is_executing());
    assert_eq!(viz.highlights().count(), 0);
    assert!(viz.markers(now).is_empty());
    assert_eq!(viz.log().count(), 0);
}

#[test]
fn event_log_is_bounded() {
    let graph = GraphStore::new();
    let mut viz = ExecutionVisualizer::new(HIGHLIGHT, FLOW, 3);
    let now = Instant::now();

    for name in ["a", "b", "c", "d", "e"] {
        viz.apply(&started(name), &graph, now);
    }
    let logged: Vec<_> = viz
        .log()
        .filter_map(|event| event.node_id.as_ref().map(|id| id.as_str().to_string()))
        .collect();
    assert_eq!(
        logged,
        vec!["c".to_string(), "d".to_string(), "e".to_string()]
    );
}

#[test]
fn variable_updates_land_in_the_watch_table() {
    let graph = GraphStore::new();
    let mut viz = visualizer();
    let update = with_data(
        ExecutionEvent::new(ExecutionEventType::VariableUpdate),
        json!({"name": "total", "value": 42}),
    );
    viz.apply(&update, &graph, Instant::now());
    assert_eq!(viz.watches().get("total"), Some(&json!(42)));
}

#[test]
fn speed_never_drops_below_minimum() {
    let mut viz = visualizer();
    viz.set_execution_speed(0.0);
    assert_eq!(viz.execution_speed(), MIN_EXECUTION_SPEED);
    assert_eq!(viz.flow_duration(), FLOW.div_f64(MIN_EXECUTION_SPEED));
}
