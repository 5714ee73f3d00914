//! Pipeline error taxonomy
//!
//! Every failure a stage can hit is one of these kinds. The kind decides the
//! HTTP status the task handler replies with, which in turn decides whether
//! the queue redelivers the task.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Boxed underlying cause of an external or internal failure.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed body, schema violation, unknown field, wrong media type, oversize body.
    #[error("{message}")]
    Validation { message: String, status: StatusCode },

    /// A zero request id reached a persisted path.
    #[error("identity error: {message}")]
    Identity { message: String },

    /// Unsupported media scheme or extension.
    #[error("unsupported media: {message}")]
    MediaUnsupported { message: String },

    /// Recognition, database or queue I/O failure; the task is retried.
    #[error("external service error: {message}")]
    ExternalTransient {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    /// An external collaborator rejected the request itself.
    #[error("external service rejected request: {message}")]
    ExternalPermanent {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    /// The task deadline elapsed while waiting on an external call.
    #[error("deadline of {}s exceeded while {action}", .after.as_secs())]
    DeadlineExceeded { action: String, after: Duration },

    /// A write-once timestamp key was written a second time.
    #[error("timestamps key already exists: {key}")]
    TimestampKeyExists { key: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        cause: Option<Cause>,
    },
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
        }
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            status: StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn identity(message: impl Into<String>) -> Self {
        Self::Identity {
            message: message.into(),
        }
    }

    pub fn media_unsupported(message: impl Into<String>) -> Self {
        Self::MediaUnsupported {
            message: message.into(),
        }
    }

    pub fn transient<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: Into<Cause>,
    {
        Self::ExternalTransient {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::ExternalPermanent {
            message: message.into(),
            cause: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            cause: None,
        }
    }

    /// Suggested HTTP status for the task handler reply.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { status, .. } => *status,
            Self::Identity { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MediaUnsupported { .. } => StatusCode::BAD_REQUEST,
            Self::ExternalTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExternalPermanent { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::TimestampKeyExists { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the failure ends the request with `status = ERROR`.
    pub fn terminates_request(&self) -> bool {
        matches!(
            self,
            Self::MediaUnsupported { .. } | Self::ExternalPermanent { .. }
        )
    }

    /// True when redelivering the same task cannot succeed.
    pub fn is_permanent(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
