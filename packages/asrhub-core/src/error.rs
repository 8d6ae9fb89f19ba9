//! Centralized error types for the ASR Hub core library.
//!
//! Component modules define their own small error enums (queue, buffer, pool,
//! FCM, services, recorder); everything converts into [`HubError`] at the
//! effects boundary, which maps to machine-readable codes, HTTP statuses and
//! a JSON response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses and
    /// `error_reported` events.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// Session id is not known to the hub.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Inbound audio declared a format the session was not started with.
    #[error("Invalid audio format: {0}")]
    InvalidAudioFormat(String),

    /// The session's audio queue was destroyed.
    #[error("Audio queue closed for session {0}")]
    QueueClosed(String),

    /// A buffer manager refused bytes past its cap.
    #[error("Buffer overflow: {0}")]
    BufferOverflow(String),

    /// No provider instance became available within the acquire timeout.
    #[error("Provider acquire timed out after {0:.1}s")]
    AcquireTimeout(f64),

    /// The session already holds its full lease quota.
    #[error("Session {0} exceeded its provider lease quota")]
    QuotaExceeded(String),

    /// The pool is shutting down and refuses new leases.
    #[error("Provider pool is draining")]
    PoolDraining,

    /// The current FCM state does not allow the requested transition.
    #[error("Transition rejected: {0}")]
    TransitionRejected(String),

    /// A pipeline service was unavailable for one window.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Malformed payload or protocol violation on a transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request was well-formed but semantically invalid.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Transcription failed unrecoverably mid-flight.
    #[error("Provider failure: {0}")]
    ProviderFailure(String),

    /// Recording sink failure.
    #[error("Recorder error: {0}")]
    Recorder(String),

    /// Configuration incoherent at boot.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSession(_) => "unknown_session",
            Self::InvalidAudioFormat(_) => "invalid_audio_format",
            Self::QueueClosed(_) => "queue_closed",
            Self::BufferOverflow(_) => "buffer_overflow",
            Self::AcquireTimeout(_) => "acquire_timeout",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::PoolDraining => "pool_draining",
            Self::TransitionRejected(_) => "transition_rejected",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Transport(_) => "transport_error",
            Self::Validation(_) => "invalid_request",
            Self::ProviderFailure(_) => "provider_failure",
            Self::Recorder(_) => "recorder_error",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::InvalidAudioFormat(_) | Self::Validation(_) | Self::Transport(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::TransitionRejected(_) => StatusCode::CONFLICT,
            Self::AcquireTimeout(_) | Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::PoolDraining | Self::ServiceUnavailable(_) | Self::Configuration(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error hard-fails the session (FCM goes to ERROR).
    #[must_use]
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout(_) | Self::ProviderFailure(_) | Self::Internal(_)
        )
    }
}

impl ErrorCode for HubError {
    fn code(&self) -> &'static str {
        HubError::code(self)
    }
}

/// Convenient Result alias for hub-wide operations.
pub type HubResult<T> = Result<T, HubError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for HubError {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_session_maps_to_not_found() {
        let err = HubError::UnknownSession("s-1".into());
        assert_eq!(err.code(), "unknown_session");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(!err.is_hard());
    }

    #[test]
    fn acquire_timeout_is_hard() {
        let err = HubError::AcquireTimeout(2.0);
        assert_eq!(err.code(), "acquire_timeout");
        assert!(err.is_hard());
    }

    #[test]
    fn soft_service_error_is_not_hard() {
        assert!(!HubError::ServiceUnavailable("vad".into()).is_hard());
        assert!(!HubError::BufferOverflow("wake_word".into()).is_hard());
    }
}
