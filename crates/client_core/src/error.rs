use shared::{
    domain::{ConnectionId, NodeId, SessionId},
    error::ApiError,
};
use thiserror::Error;

/// Outcome of a request/response call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("backend rejected request: {0}")]
    Rejected(ApiError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl SyncError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("connection {connection_id} would connect node {node_id} to itself")]
    SelfLoop {
        connection_id: ConnectionId,
        node_id: NodeId,
    },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("document store failure: {0}")]
    Store(#[source] anyhow::Error),
    #[error("invalid document json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unrecognized document shape: {0}")]
    UnrecognizedDocument(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("unknown debug session {0}")]
    UnknownSession(SessionId),
    #[error("push channel error: {0}")]
    PushChannel(String),
}
