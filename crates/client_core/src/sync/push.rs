//! Push notifications over the backend's Socket.IO websocket.
//!
//! Only the slice of Engine.IO v4 the backend actually uses is understood: the open
//! handshake, ping/pong keepalive, the default-namespace connect and `42` event frames.
//! Decoded events are forwarded in arrival order to the dispatcher queue.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use shared::{
    domain::{ConnectionId, DebugSessionState, NodeId, SessionId},
    graph::{NodeMetadata, NodeParameters},
    protocol::{DebugStepResult, ExecutionEvent, PushEvent, ViewportUpdate},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{dispatcher::DispatchMessage, error::ClientError, normalize};

const SOCKET_IO_PATH: &str = "/socket.io/";
const ENGINE_IO_QUERY: &str = "EIO=4&transport=websocket";

#[derive(Debug, Clone, PartialEq)]
pub enum EngineFrame {
    Open,
    Close,
    Ping,
    Pong,
    NamespaceConnected,
    NamespaceDisconnected,
    Event { name: String, payload: Value },
    Unknown,
}

/// Derives the websocket endpoint from the backend's http(s) base url.
pub fn push_url(base_url: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(base_url)
        .map_err(|err| ClientError::PushChannel(format!("invalid backend url {base_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ClientError::PushChannel(format!(
                "backend url must be http(s), got {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::PushChannel(format!("cannot use scheme {scheme}")))?;
    url.set_path(SOCKET_IO_PATH);
    url.set_query(Some(ENGINE_IO_QUERY));
    Ok(url)
}

pub fn decode_frame(text: &str) -> EngineFrame {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("42") {
        let Some(start) = rest.find('[') else {
            return EngineFrame::Unknown;
        };
        return match serde_json::from_str::<Vec<Value>>(&rest[start..]) {
            Ok(parts) => {
                let mut parts = parts.into_iter();
                match parts.next() {
                    Some(Value::String(name)) => EngineFrame::Event {
                        name,
                        payload: parts.next().unwrap_or(Value::Null),
                    },
                    _ => EngineFrame::Unknown,
                }
            }
            Err(err) => {
                debug!("dropping undecodable event frame: {err}");
                EngineFrame::Unknown
            }
        };
    }
    if text.starts_with("40") {
        return EngineFrame::NamespaceConnected;
    }
    if text.starts_with("41") {
        return EngineFrame::NamespaceDisconnected;
    }
    if text.starts_with('{') {
        return match serde_json::from_str::<Map<String, Value>>(text) {
            Ok(mut fields) => match fields.remove("event") {
                Some(Value::String(name)) => EngineFrame::Event {
                    name,
                    payload: fields.remove("data").unwrap_or(Value::Null),
                },
                _ => EngineFrame::Unknown,
            },
            Err(_) => EngineFrame::Unknown,
        };
    }
    match text.chars().next() {
        Some('0') => EngineFrame::Open,
        Some('1') => EngineFrame::Close,
        Some('2') => EngineFrame::Ping,
        Some('3') => EngineFrame::Pong,
        _ => EngineFrame::Unknown,
    }
}

fn field<T: DeserializeOwned>(payload: &Value, key: &str) -> Option<T> {
    payload
        .get(key)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

fn object(payload: &Value, key: &str) -> Map<String, Value> {
    match payload.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Pushes must name their entity; an id made up here would differ on every redelivery.
fn carries_id(entity: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .any(|key| matches!(entity.get(*key), Some(Value::String(_) | Value::Number(_))))
}

/// Returns `None` for unknown names or payloads missing the fields that identify
/// the target entity.
pub fn decode_event(name: &str, payload: &Value) -> Option<PushEvent> {
    let event = match name {
        "node_added" => {
            let fallback_id: Option<String> = field(payload, "node_id");
            let node = payload.get("node").unwrap_or(payload);
            if fallback_id.is_none() && !carries_id(node, &["id", "node_id"]) {
                debug!("dropping node_added without a node id");
                return None;
            }
            PushEvent::NodeAdded {
                node: normalize::normalize_node(node, fallback_id.as_deref())?,
            }
        }
        "node_removed" => PushEvent::NodeRemoved {
            node_id: field::<NodeId>(payload, "node_id")?,
        },
        "node_moved" => PushEvent::NodeMoved {
            node_id: field::<NodeId>(payload, "node_id")?,
            position: normalize::normalize_position(Some(payload.get("position")?)),
        },
        "node_updated" => PushEvent::NodeUpdated {
            node_id: field::<NodeId>(payload, "node_id")?,
            changes: object(payload, "changes"),
        },
        "node_parameters_updated" => PushEvent::NodeParametersUpdated {
            node_id: field::<NodeId>(payload, "node_id")?,
            parameters: NodeParameters::from_value(Value::Object(object(payload, "parameters"))),
        },
        "node_metadata_updated" => PushEvent::NodeMetadataUpdated {
            node_id: field::<NodeId>(payload, "node_id")?,
            metadata: NodeMetadata::from_value(Value::Object(object(payload, "metadata"))),
        },
        "node_ports_updated" => PushEvent::NodePortsUpdated {
            node_id: field::<NodeId>(payload, "node_id")?,
            inputs: normalize::normalize_ports(payload.get("inputs"), "input"),
            outputs: normalize::normalize_ports(payload.get("outputs"), "output"),
        },
        "connection_added" => {
            let connection = payload.get("connection").unwrap_or(payload);
            if !carries_id(connection, &["id", "connection_id"]) {
                debug!("dropping connection_added without a connection id");
                return None;
            }
            PushEvent::ConnectionAdded {
                connection: normalize::normalize_connection(connection)?,
            }
        }
        "connection_removed" => PushEvent::ConnectionRemoved {
            connection_id: field::<ConnectionId>(payload, "connection_id")?,
        },
        "canvas_cleared" => PushEvent::CanvasCleared,
        "viewport_changed" => PushEvent::ViewportChanged(
            serde_json::from_value::<ViewportUpdate>(payload.clone()).unwrap_or_default(),
        ),
        "paradigm_changed" => PushEvent::ParadigmChanged {
            paradigm: field::<String>(payload, "type").or_else(|| field(payload, "paradigm"))?,
        },
        "execution_event" => match serde_json::from_value::<ExecutionEvent>(payload.clone()) {
            Ok(event) => PushEvent::Execution(event),
            Err(err) => {
                debug!("dropping malformed execution event: {err}");
                return None;
            }
        },
        "debug_session_started" => PushEvent::DebugSessionStarted {
            session_id: field::<SessionId>(payload, "session_id")?,
            state: field::<DebugSessionState>(payload, "state")
                .unwrap_or(DebugSessionState::Running),
        },
        "debug_step_executed" => PushEvent::DebugStepExecuted {
            session_id: field::<SessionId>(payload, "session_id")?,
            result: field::<DebugStepResult>(payload, "result").unwrap_or_default(),
        },
        "debug_session_stopped" => PushEvent::DebugSessionStopped {
            session_id: field::<SessionId>(payload, "session_id")?,
        },
        "all_sessions_completed" => PushEvent::AllSessionsCompleted {
            results: object(payload, "results"),
        },
        other => {
            debug!(event = other, "ignoring unknown push event");
            return None;
        }
    };
    Some(event)
}

/// Connects to the push endpoint and forwards decoded events to `sink` until the
/// socket closes. The close reason is delivered as a final `PushClosed` message.
pub async fn spawn_push_listener(
    base_url: &str,
    sink: mpsc::Sender<DispatchMessage>,
) -> Result<JoinHandle<()>, ClientError> {
    let url = push_url(base_url)?;
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| {
            ClientError::PushChannel(format!("failed to connect websocket {url}: {err}"))
        })?;
    info!(%url, "push channel connected");
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    Ok(tokio::spawn(async move {
        let reason = loop {
            let Some(message) = ws_reader.next().await else {
                break "push stream ended".to_string();
            };
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(frame)) => {
                    break frame
                        .map(|frame| frame.reason.to_string())
                        .unwrap_or_else(|| "closed by backend".into());
                }
                Ok(_) => continue,
                Err(err) => break format!("push stream error: {err}"),
            };

            match decode_frame(&text) {
                EngineFrame::Open => {
                    if let Err(err) = ws_writer.send(Message::Text("40".into())).await {
                        break format!("failed to join namespace: {err}");
                    }
                }
                EngineFrame::Ping => {
                    if let Err(err) = ws_writer.send(Message::Text("3".into())).await {
                        break format!("failed to answer ping: {err}");
                    }
                }
                EngineFrame::Event { name, payload } => {
                    let Some(event) = decode_event(&name, &payload) else {
                        continue;
                    };
                    if sink.send(DispatchMessage::Push(event)).await.is_err() {
                        debug!("dispatcher gone; stopping push listener");
                        return;
                    }
                }
                EngineFrame::Close | EngineFrame::NamespaceDisconnected => {
                    break "backend closed the session".to_string();
                }
                EngineFrame::NamespaceConnected | EngineFrame::Pong | EngineFrame::Unknown => {}
            }
        };

        warn!(%reason, "push channel closed");
        let _ = sink.send(DispatchMessage::PushClosed { reason }).await;
    }))
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
