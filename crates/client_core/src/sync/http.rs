use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use shared::{
    domain::{ConnectionId, ExecutionMode, NodeId, SessionId, StepType},
    error::{ApiError, ErrorCode},
    graph::{NodeMetadata, NodeParameters, Position},
    protocol::{
        ApiEnvelope, CanvasLoad, CodeExportRequest, CreateConnectionRequest,
        CreateDebugSessionRequest, CreateNodeRequest, CreatedConnection, CreatedNode,
        DebugSessionAck, DebugSessionList, DebugStepResponse, MetadataUpdate, ParametersUpdate,
        PatternRefactorRequest, PatternSearchRequest, PortsUpdate, RunAllResponse, ViewportUpdate,
    },
};
use tracing::{debug, warn};

use super::{SyncChannel, SyncResult};
use crate::{error::SyncError, normalize};

/// Request/response surface over the backend's REST routes.
pub struct HttpSyncChannel {
    http: Client,
    base_url: String,
}

#[derive(serde::Deserialize)]
struct ActiveParadigm {
    #[serde(default)]
    active_paradigm: Option<String>,
}

impl HttpSyncChannel {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let response = self.http.get(self.url(path)).send().await?;
        decode_response(path, response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> SyncResult<T> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        decode_response(path, response).await
    }

    async fn patch<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> SyncResult<T> {
        let response = self.http.patch(self.url(path)).json(body).send().await?;
        decode_response(path, response).await
    }

    async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> SyncResult<T> {
        let response = self.http.put(self.url(path)).json(body).send().await?;
        decode_response(path, response).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let response = self.http.delete(self.url(path)).send().await?;
        decode_response(path, response).await
    }
}

async fn decode_response<T: DeserializeOwned>(path: &str, response: Response) -> SyncResult<T> {
    let status = response.status();
    let body = response.bytes().await?;

    let envelope: ApiEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) if status.is_success() => {
            warn!(path, "backend response is not an envelope: {err}");
            return Err(SyncError::Malformed(err.to_string()));
        }
        Err(_) => {
            warn!(path, status = status.as_u16(), "backend request failed");
            return Err(SyncError::Transport(format!("{path} answered {status}")));
        }
    };

    if !envelope.success {
        let message = envelope
            .error
            .unwrap_or_else(|| format!("{path} failed with {status}"));
        debug!(
            path,
            status = status.as_u16(),
            %message,
            "backend rejected request"
        );
        return Err(SyncError::Rejected(ApiError::new(
            ErrorCode::from_status(status.as_u16()),
            message,
        )));
    }

    serde_json::from_value(envelope.into_payload()).map_err(|err| {
        warn!(path, "unexpected payload shape: {err}");
        SyncError::Malformed(err.to_string())
    })
}

#[async_trait]
impl SyncChannel for HttpSyncChannel {
    async fn fetch_canvas(&self) -> SyncResult<CanvasLoad> {
        let nodes: Value = self.get("/api/canvas/nodes").await?;
        let connections: Value = self.get("/api/canvas/connections").await?;
        let viewport: Value = self.get("/api/canvas/viewport").await?;

        let connections = match connections {
            Value::Array(items) => items
                .iter()
                .filter_map(normalize::normalize_connection)
                .collect(),
            other => {
                return Err(SyncError::Malformed(format!(
                    "expected a connection list, got {other}"
                )))
            }
        };

        Ok(CanvasLoad {
            nodes: normalize::normalize_nodes(Some(&nodes)),
            connections,
            viewport: normalize::normalize_viewport(Some(&viewport)),
        })
    }

    async fn create_node(&self, request: &CreateNodeRequest) -> SyncResult<NodeId> {
        let created: CreatedNode = self.post("/api/canvas/nodes", request).await?;
        Ok(created.node_id)
    }

    async fn move_node(&self, node_id: &NodeId, position: Position) -> SyncResult<()> {
        let _: Value = self
            .post(
                &format!("/api/canvas/nodes/{node_id}/move"),
                &json!({ "position": position }),
            )
            .await?;
        Ok(())
    }

    async fn delete_node(&self, node_id: &NodeId) -> SyncResult<()> {
        let _: Value = self.delete(&format!("/api/canvas/nodes/{node_id}")).await?;
        Ok(())
    }

    async fn update_node_parameters(
        &self,
        node_id: &NodeId,
        parameters: &Map<String, Value>,
    ) -> SyncResult<NodeParameters> {
        let updated: ParametersUpdate = self
            .patch(
                &format!("/api/canvas/nodes/{node_id}/parameters"),
                &json!({ "parameters": parameters }),
            )
            .await?;
        Ok(NodeParameters::from_value(Value::Object(updated.parameters)))
    }

    async fn update_node_metadata(
        &self,
        node_id: &NodeId,
        metadata: &Map<String, Value>,
    ) -> SyncResult<NodeMetadata> {
        let updated: MetadataUpdate = self
            .patch(
                &format!("/api/canvas/nodes/{node_id}/metadata"),
                &json!({ "metadata": metadata }),
            )
            .await?;
        Ok(NodeMetadata::from_value(Value::Object(updated.metadata)))
    }

    async fn update_node_ports(
        &self,
        node_id: &NodeId,
        ports: &PortsUpdate,
    ) -> SyncResult<PortsUpdate> {
        self.put(&format!("/api/canvas/nodes/{node_id}/ports"), ports)
            .await
    }

    async fn create_connection(
        &self,
        request: &CreateConnectionRequest,
    ) -> SyncResult<ConnectionId> {
        let created: CreatedConnection = self.post("/api/canvas/connections", request).await?;
        Ok(created.connection_id)
    }

    async fn delete_connection(&self, connection_id: &ConnectionId) -> SyncResult<()> {
        let _: Value = self
            .delete(&format!("/api/canvas/connections/{connection_id}"))
            .await?;
        Ok(())
    }

    async fn clear_canvas(&self) -> SyncResult<()> {
        let _: Value = self.post("/api/canvas/clear", &json!({})).await?;
        Ok(())
    }

    async fn set_viewport_zoom(&self, zoom: f64, center: (f64, f64)) -> SyncResult<ViewportUpdate> {
        self.post(
            "/api/canvas/viewport/zoom",
            &json!({ "zoom": zoom, "center_x": center.0, "center_y": center.1 }),
        )
        .await
    }

    async fn pan_viewport(&self, delta_x: f64, delta_y: f64) -> SyncResult<ViewportUpdate> {
        self.post(
            "/api/canvas/viewport/pan",
            &json!({ "delta_x": delta_x, "delta_y": delta_y }),
        )
        .await
    }

    async fn start_execution(&self, mode: ExecutionMode) -> SyncResult<Value> {
        self.post("/api/execution/start", &json!({ "mode": mode }))
            .await
    }

    async fn step_execution(&self) -> SyncResult<Value> {
        self.post("/api/execution/step", &json!({})).await
    }

    async fn stop_execution(&self) -> SyncResult<Value> {
        self.post("/api/execution/stop", &json!({})).await
    }

    async fn create_debug_session(
        &self,
        request: &CreateDebugSessionRequest,
    ) -> SyncResult<DebugSessionAck> {
        self.post("/api/execution/multi-debug/create", request)
            .await
    }

    async fn start_debug_session(&self, session_id: &SessionId) -> SyncResult<DebugSessionAck> {
        self.post(
            &format!("/api/execution/multi-debug/start/{session_id}"),
            &json!({}),
        )
        .await
    }

    async fn step_debug_session(
        &self,
        session_id: &SessionId,
        step_type: StepType,
    ) -> SyncResult<DebugStepResponse> {
        self.post(
            &format!("/api/execution/multi-debug/step/{session_id}"),
            &json!({ "step_type": step_type }),
        )
        .await
    }

    async fn stop_debug_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let _: Value = self
            .post(
                &format!("/api/execution/multi-debug/stop/{session_id}"),
                &json!({}),
            )
            .await?;
        Ok(())
    }

    async fn run_all_debug_sessions(&self, timeout: Duration) -> SyncResult<RunAllResponse> {
        self.post(
            "/api/execution/multi-debug/run-all",
            &json!({ "timeout": timeout.as_secs() }),
        )
        .await
    }

    async fn list_debug_sessions(&self) -> SyncResult<DebugSessionList> {
        self.get("/api/execution/multi-debug/list").await
    }

    async fn pattern_search(&self, request: &PatternSearchRequest) -> SyncResult<Value> {
        self.post("/api/ast-grep/search", request).await
    }

    async fn pattern_refactor(&self, request: &PatternRefactorRequest) -> SyncResult<Value> {
        self.post("/api/ast-grep/refactor", request).await
    }

    async fn export_code(&self, request: &CodeExportRequest) -> SyncResult<Value> {
        self.post("/api/export/code", request).await
    }

    async fn set_active_paradigm(&self, paradigm: &str) -> SyncResult<Option<String>> {
        let active: ActiveParadigm = self
            .post("/api/paradigms/active", &json!({ "type": paradigm }))
            .await?;
        Ok(active.active_paradigm)
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
