//! Centralized error types for the Auricast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::packet::PacketError;
use crate::sender::SenderError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for PacketError {
    fn code(&self) -> &'static str {
        match self {
            PacketError::TooShort { .. } => "packet_too_short",
            PacketError::BadSize { .. } => "packet_bad_size",
            PacketError::UnsupportedBitDepth(_) => "unsupported_bit_depth",
            PacketError::BadChannelCount(_) => "bad_channel_count",
            PacketError::BadSampleRate(_) => "bad_sample_rate",
            PacketError::Misaligned { .. } => "payload_misaligned",
            PacketError::UnknownPayloadType(_) => "unknown_payload_type",
        }
    }
}

impl ErrorCode for SenderError {
    fn code(&self) -> &'static str {
        match self {
            SenderError::Socket(_) => "sender_socket_error",
            SenderError::Closed => "sender_closed",
            SenderError::Encode(_) => "sender_encode_error",
            SenderError::Session(_) => "sender_session_error",
        }
    }
}

/// Application-wide error type for the Auricast engine.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum RouteError {
    /// Requested sink ID does not exist in the engine.
    #[error("Sink not found: {0}")]
    SinkNotFound(String),

    /// Requested source path does not exist in the engine.
    #[error("Source path not found: {0}")]
    PathNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A desired-state document failed validation before apply.
    #[error("Invalid desired state: {0}")]
    InvalidState(String),

    /// Socket setup or network-level failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Wire-level sender failure (session setup, encode, send).
    #[error("Sender error: {0}")]
    Sender(String),

    /// WebRTC session negotiation failure.
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Engine configuration error (missing or inconsistent settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouteError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SinkNotFound(_) => "sink_not_found",
            Self::PathNotFound(_) => "path_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidState(_) => "invalid_state",
            Self::Network(_) => "network_error",
            Self::Sender(_) => "sender_error",
            Self::WebRtc(_) => "webrtc_error",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SinkNotFound(_) | Self::PathNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::InvalidState(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for engine-wide operations.
pub type RouteResult<T> = Result<T, RouteError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SenderError> for RouteError {
    fn from(err: SenderError) -> Self {
        Self::Sender(err.to_string())
    }
}

impl From<PacketError> for RouteError {
    fn from(err: PacketError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<std::io::Error> for RouteError {
    fn from(err: std::io::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_not_found_maps_to_404() {
        let err = RouteError::SinkNotFound("office".into());
        assert_eq!(err.code(), "sink_not_found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_state_maps_to_400() {
        let err = RouteError::InvalidState("duplicate sink id".into());
        assert_eq!(err.code(), "invalid_state");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn io_error_converts_to_network() {
        let err: RouteError = std::io::Error::other("bind failed").into();
        assert_eq!(err.code(), "network_error");
    }
}
