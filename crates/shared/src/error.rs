use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            400 | 409 | 422 => Self::Validation,
            502..=504 => Self::Unavailable,
            _ => Self::Internal,
        }
    }
}

/// A request the backend answered with `success: false`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}
