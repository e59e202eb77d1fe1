//! Handler error types

use crate::protocol::FrameError;
use thiserror::Error;

/// Errors a [`Handler`](super::Handler) reports back to the connection.
/// Every one of them closes the connection it occurred on.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Body could not be understood
    #[error("Invalid body: {0}")]
    InvalidBody(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Stable code for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::InvalidBody(_) | Self::Frame(_) => "INVALID_BODY",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidBody(e.to_string())
    }
}

/// Handler result type
pub type HandlerResult<T> = Result<T, HandlerError>;
