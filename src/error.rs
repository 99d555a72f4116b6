//! Broker error types with HTTP status code mapping.
//!
//! [`BrokerError`] is the central error type for the broker. Every failure
//! surfaced to a caller of the session or broker API is one of its variants.
//! Transport-level I/O errors never appear here: the session pumps absorb
//! them and callers only see their effect as [`BrokerError::Disconnected`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::domain::SessionId;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "session not found: CID-1270001-1700000000"
///   }
/// }
/// ```
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`BrokerError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Broker-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category             | HTTP Status                  |
/// |-----------|----------------------|------------------------------|
/// | 1000–1999 | Validation           | 400 Bad Request              |
/// | 2000–2999 | Session state        | 404 Not Found / 409 Conflict |
/// | 3000–3999 | Broker capacity      | 503 Service Unavailable      |
/// | 4000–4999 | Transport / timeouts | 502 / 504                    |
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The WebSocket handshake or the post-handshake registration failed.
    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),

    /// No live member is registered under the given identity.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// A queue did not accept the request within the write timeout.
    #[error("write timeout")]
    WriteTimeout,

    /// The control loop input stayed full for the whole write timeout.
    #[error("broker busy: control queue is full")]
    BrokerBusy,

    /// The control loop has exited; the broker no longer accepts requests.
    #[error("broker unavailable")]
    BrokerUnavailable,

    /// The session's outbound queue was full; the session is being evicted.
    #[error("outbound queue full for {0}, closing connection")]
    ConnectionClosing(SessionId),

    /// Message type tag other than text (1) or binary (2).
    #[error("unsupported message type: {0}, use text (1) or binary (2)")]
    UnsupportedMessageType(u8),

    /// Text payload is not valid UTF-8.
    #[error("invalid UTF-8 data for text message")]
    InvalidTextEncoding,

    /// An encoded frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The session has been deregistered and its queues are closed.
    #[error("session {0} disconnected")]
    Disconnected(SessionId),

    /// An empty identity was supplied.
    #[error("invalid empty id, keeping the current id")]
    EmptyId,

    /// The requested identity is already held by another live session.
    #[error("id already in use: {0}")]
    DuplicateId(SessionId),
}

impl BrokerError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::EmptyId => 1001,
            Self::UnsupportedMessageType(_) => 1002,
            Self::InvalidTextEncoding => 1003,
            Self::MalformedFrame(_) => 1004,
            Self::SessionNotFound(_) => 2001,
            Self::Disconnected(_) => 2002,
            Self::DuplicateId(_) => 2003,
            Self::ConnectionClosing(_) => 2004,
            Self::BrokerBusy => 3001,
            Self::BrokerUnavailable => 3002,
            Self::UpgradeFailed(_) => 4001,
            Self::WriteTimeout => 4002,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyId
            | Self::UnsupportedMessageType(_)
            | Self::InvalidTextEncoding
            | Self::MalformedFrame(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) | Self::Disconnected(_) => StatusCode::NOT_FOUND,
            Self::DuplicateId(_) | Self::ConnectionClosing(_) => StatusCode::CONFLICT,
            Self::BrokerBusy | Self::BrokerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpgradeFailed(_) => StatusCode::BAD_GATEWAY,
            Self::WriteTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
