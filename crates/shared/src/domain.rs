use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(NodeId);
id_newtype!(ConnectionId);
id_newtype!(SessionId);

const LOCAL_FALLBACK_PREFIX: &str = "local-";

/// Where a node's id came from.
///
/// A node the backend refused to create during a restore is still rendered, but
/// under a synthetic id the backend has never seen. Operations on such a node stay
/// client-side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeIdentity {
    Remote(NodeId),
    LocalFallback(NodeId),
}

impl NodeIdentity {
    pub fn local_fallback() -> Self {
        Self::LocalFallback(NodeId(format!("{LOCAL_FALLBACK_PREFIX}{}", Uuid::new_v4())))
    }

    pub fn id(&self) -> &NodeId {
        match self {
            Self::Remote(id) | Self::LocalFallback(id) => id,
        }
    }

    pub fn into_id(self) -> NodeId {
        match self {
            Self::Remote(id) | Self::LocalFallback(id) => id,
        }
    }

    pub fn is_local_fallback(&self) -> bool {
        matches!(self, Self::LocalFallback(_))
    }
}

pub fn local_connection_id() -> ConnectionId {
    ConnectionId(format!("{LOCAL_FALLBACK_PREFIX}conn-{}", Uuid::new_v4()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DebugSessionState {
    #[default]
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl DebugSessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Next,
    Into,
    Over,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Normal,
    Debug,
    Step,
}
