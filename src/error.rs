//! # Error Handling
//!
//! Error types for the two faces of the server:
//!
//! - **AppError**: returned by HTTP handlers and converted into JSON error responses
//!   through actix-web's `ResponseError` trait.
//! - **SendError / ProtocolError**: produced by the protocol engine. These never reach an
//!   HTTP client; the engine logs them and keeps the connection alive (see `session`).
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "conversation c1 not found",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the REST and operational endpoints.
#[derive(Debug, Error)]
pub enum AppError {
    /// Server-side failure that the client cannot fix
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client sent malformed or incomplete data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown conversation or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or wrong bearer token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Registry refused the operation (duplicate id, capacity reached)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// User input failed validation rules
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Conflict(_) => "conflict",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Unauthorized(msg)
            | AppError::Conflict(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg) => msg,
        }
    }
}

/// Maps each error to an HTTP status and the JSON body shown in the module docs.
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>` used by the HTTP handlers.
pub type AppResult<T> = Result<T, AppError>;

/// Failure of a single outbound delivery.
///
/// A failed send only fails the operation that issued it; the connection's processing
/// loop keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The conversation has ended; nothing more may be written
    #[error("connection closed")]
    ConnectionClosed,

    /// The conversation has no message channel attached (REST conversation without a
    /// websocket side channel)
    #[error("no message channel attached")]
    NoChannel,

    /// The transport refused or lost the write
    #[error("transport error: {0}")]
    Transport(String),

    /// The outbound message could not be encoded
    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Failure to turn one inbound frame into a protocol message.
///
/// Every variant is recoverable: the frame is logged and discarded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("invalid {message_type} message: {reason}")]
    InvalidShape {
        message_type: String,
        reason: String,
    },

    #[error("audio chunk is not valid base64: {0}")]
    InvalidAudioChunk(#[from] base64::DecodeError),
}

/// Failure of an outbound audio stream.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to send stream message: {0}")]
    Send(#[from] SendError),

    #[error("failed to read audio source: {0}")]
    Source(#[from] std::io::Error),
}
