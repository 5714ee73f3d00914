use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use super::body::{decode_json, read_body, require_json, MAX_BODY_BYTES};
use super::{not_found, running, IngressContext};
use crate::error::{PipelineError, Result};
use crate::pipeline::RequestRecord;
use crate::stages::ingress::REQUESTS_PATH;
use crate::stages::{SubmitRequest, SubmitResponse};

pub fn ingress_router(ctx: Arc<IngressContext>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route(REQUESTS_PATH, post(submit))
        .route(&format!("{}/{{id}}", REQUESTS_PATH), get(status))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(ctx)
}

async fn liveness(State(ctx): State<Arc<IngressContext>>) -> String {
    running(&ctx.service)
}

async fn submit(
    State(ctx): State<Arc<IngressContext>>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Result<Json<SubmitResponse>> {
    require_json(&headers)?;
    let body = read_body(body)?;
    let request: SubmitRequest = decode_json(&body)?;

    let response = ctx.ingress.submit(request).await.map_err(|e| {
        tracing::warn!(status = e.status_code().as_u16(), "Request refused: {}", e);
        e
    })?;
    Ok(Json(response))
}

async fn status(
    State(ctx): State<Arc<IngressContext>>,
    Path(id): Path<String>,
) -> Result<Json<RequestRecord>> {
    let id = Uuid::parse_str(&id)
        .map_err(|e| PipelineError::validation(format!("invalid request id '{}': {}", id, e)))?;
    Ok(Json(ctx.ingress.status(id).await?))
}
