//! Request body checks shared by the task worker and the ingress API

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::error::Category;

use crate::error::{PipelineError, Result};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Reject anything that is not `application/json`
pub fn require_json(headers: &HeaderMap) -> Result<()> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();

    if essence.eq_ignore_ascii_case("application/json") {
        Ok(())
    } else if content_type.is_empty() {
        Err(PipelineError::unsupported_media_type(
            "Content-Type header is not application/json",
        ))
    } else {
        Err(PipelineError::unsupported_media_type(format!(
            "Content-Type header {} is not application/json",
            content_type
        )))
    }
}

/// Unwrap the buffered body, mapping the size limit to 413
pub fn read_body(body: std::result::Result<Bytes, BytesRejection>) -> Result<Bytes> {
    body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            PipelineError::payload_too_large(format!(
                "request body must not be larger than {} bytes",
                MAX_BODY_BYTES
            ))
        } else {
            PipelineError::validation(rejection.body_text())
        }
    })
}

/// Decode a JSON body, reporting where a malformed document broke
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.is_empty() {
        return Err(PipelineError::validation("request body must not be empty"));
    }

    serde_json::from_slice(bytes).map_err(|e| match e.classify() {
        Category::Data => PipelineError::validation(format!("invalid request body: {}", e)),
        Category::Syntax | Category::Eof | Category::Io => PipelineError::validation(format!(
            "request body contains badly-formed JSON (at line {} column {})",
            e.line(),
            e.column()
        )),
    })
}
