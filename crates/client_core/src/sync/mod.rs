//! Backend seams: the request/response surface and the push stream.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::{
    domain::{ConnectionId, ExecutionMode, NodeId, SessionId, StepType},
    graph::{NodeMetadata, NodeParameters, Position},
    protocol::{
        CanvasLoad, CodeExportRequest, CreateConnectionRequest, CreateDebugSessionRequest,
        CreateNodeRequest, DebugSessionAck, DebugSessionList, DebugStepResponse,
        PatternRefactorRequest, PatternSearchRequest, PortsUpdate, RunAllResponse, ViewportUpdate,
    },
};

use crate::error::SyncError;

pub mod http;
pub mod memory;
pub mod push;

pub use http::HttpSyncChannel;
pub use memory::MemorySyncChannel;

pub type SyncResult<T> = Result<T, SyncError>;

#[async_trait]
pub trait SyncChannel: Send + Sync {
    async fn fetch_canvas(&self) -> SyncResult<CanvasLoad>;

    /// Returns the id the backend assigned. The node itself arrives later as a push.
    async fn create_node(&self, request: &CreateNodeRequest) -> SyncResult<NodeId>;
    async fn move_node(&self, node_id: &NodeId, position: Position) -> SyncResult<()>;
    async fn delete_node(&self, node_id: &NodeId) -> SyncResult<()>;
    async fn update_node_parameters(
        &self,
        node_id: &NodeId,
        parameters: &Map<String, Value>,
    ) -> SyncResult<NodeParameters>;
    async fn update_node_metadata(
        &self,
        node_id: &NodeId,
        metadata: &Map<String, Value>,
    ) -> SyncResult<NodeMetadata>;
    async fn update_node_ports(
        &self,
        node_id: &NodeId,
        ports: &PortsUpdate,
    ) -> SyncResult<PortsUpdate>;

    async fn create_connection(
        &self,
        request: &CreateConnectionRequest,
    ) -> SyncResult<ConnectionId>;
    async fn delete_connection(&self, connection_id: &ConnectionId) -> SyncResult<()>;
    async fn clear_canvas(&self) -> SyncResult<()>;

    async fn set_viewport_zoom(&self, zoom: f64, center: (f64, f64)) -> SyncResult<ViewportUpdate>;
    async fn pan_viewport(&self, delta_x: f64, delta_y: f64) -> SyncResult<ViewportUpdate>;

    async fn start_execution(&self, mode: ExecutionMode) -> SyncResult<Value>;
    async fn step_execution(&self) -> SyncResult<Value>;
    async fn stop_execution(&self) -> SyncResult<Value>;

    async fn create_debug_session(
        &self,
        request: &CreateDebugSessionRequest,
    ) -> SyncResult<DebugSessionAck>;
    async fn start_debug_session(&self, session_id: &SessionId) -> SyncResult<DebugSessionAck>;
    async fn step_debug_session(
        &self,
        session_id: &SessionId,
        step_type: StepType,
    ) -> SyncResult<DebugStepResponse>;
    async fn stop_debug_session(&self, session_id: &SessionId) -> SyncResult<()>;
    async fn run_all_debug_sessions(&self, timeout: Duration) -> SyncResult<RunAllResponse>;
    async fn list_debug_sessions(&self) -> SyncResult<DebugSessionList>;

    async fn pattern_search(&self, request: &PatternSearchRequest) -> SyncResult<Value>;
    async fn pattern_refactor(&self, request: &PatternRefactorRequest) -> SyncResult<Value>;
    async fn export_code(&self, request: &CodeExportRequest) -> SyncResult<Value>;

    /// Returns the paradigm the backend reports as active after the switch.
    async fn set_active_paradigm(&self, paradigm: &str) -> SyncResult<Option<String>>;
}
