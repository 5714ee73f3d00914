//! Generic task worker
//!
//! One handler drives every internal stage: check the delivery headers and
//! body, decode and validate the record, bracket the stage's work with its
//! `Begin`/`End` timestamps, persist the merge and enqueue to the next hop.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, info, warn, Instrument};

use super::body::{decode_json, read_body, require_json, MAX_BODY_BYTES};
use super::{not_found, running, StageContext};
use crate::error::{PipelineError, Result};
use crate::pipeline::{RequestRecord, RequestStatus, StageOutput, Timestamp};
use crate::storage::RepositoryError;

pub const TASK_NAME_HEADER: &str = "X-Taskname";
pub const QUEUE_NAME_HEADER: &str = "X-Queuename";

pub fn worker_router(ctx: Arc<StageContext>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/task_handler", post(task_handler))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(ctx)
}

async fn liveness(State(ctx): State<Arc<StageContext>>) -> String {
    running(&ctx.service)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn task_handler(
    State(ctx): State<Arc<StageContext>>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Result<Response> {
    let started = Timestamp::now();
    let task = header(&headers, TASK_NAME_HEADER)
        .ok_or_else(|| PipelineError::validation("Invalid Task"))?
        .to_string();
    let queue = header(&headers, QUEUE_NAME_HEADER)
        .unwrap_or_default()
        .to_string();

    require_json(&headers)?;
    let body = read_body(body)?;
    let record: RequestRecord = decode_json(&body)?;
    record.validate_schema()?;

    let span = tracing::info_span!(
        "task",
        stage = %ctx.kind,
        task = %task,
        queue = %queue,
        request_id = %record.request_id
    );

    let result = run_task(&ctx, record, started).instrument(span.clone()).await;
    if let Err(e) = &result {
        span.in_scope(|| {
            if e.is_permanent() {
                warn!(status = e.status_code().as_u16(), "Task rejected: {}", e);
            } else {
                warn!(status = e.status_code().as_u16(), "Task failed, will be retried: {}", e);
            }
        });
    }
    result
}

/// Stage work for one decoded, schema-valid record. `started` becomes the
/// stage's `Begin` timestamp.
pub async fn run_task(
    ctx: &StageContext,
    mut record: RequestRecord,
    started: Timestamp,
) -> Result<Response> {
    let persisted_path = !record.has_zero_id();
    if !persisted_path {
        if ctx.deployed {
            return Err(PipelineError::identity(
                "record reached a stage without a request id",
            ));
        }
        warn!("Record has no request id; processing without persistence");
    }

    let begin_key = ctx.kind.begin_key();
    let end_key = ctx.kind.end_key();

    if persisted_path {
        match ctx.repository.find_by_id(record.request_id).await {
            Ok(stored) if stored.timestamps.contains_key(&begin_key) => {
                return replay_duplicate(ctx, stored, begin_key).await;
            }
            Ok(_) | Err(RepositoryError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    record.set_timestamp(begin_key, started)?;

    let output = match ctx.stage.process(&mut record).await {
        Ok(output) => output,
        Err(e) if e.terminates_request() => {
            return Err(fail_request(ctx, record, e, persisted_path).await);
        }
        Err(e) => return Err(e),
    };

    record.set_timestamp(end_key, Timestamp::now())?;

    let persisted = if persisted_path {
        ctx.repository.update(&record).await?
    } else {
        record
    };

    match output {
        StageOutput::Complete(completed) => Ok((StatusCode::OK, Json(completed)).into_response()),
        StageOutput::Forward => {
            forward(ctx, &persisted).await?;
            Ok((StatusCode::OK, Json(persisted)).into_response())
        }
    }
}

async fn forward(ctx: &StageContext, record: &RequestRecord) -> Result<()> {
    match &ctx.next {
        Some(next) => {
            let task = ctx.queue.add(next, record).await?;
            info!(next = %next.target_service, next_task = %task, "Stage finished");
        }
        None => warn!("Stage finished but no next queue is configured"),
    }
    Ok(())
}

/// A copy of this task already committed. Make sure the next hop has its
/// task, then refuse the duplicate.
async fn replay_duplicate(
    ctx: &StageContext,
    stored: RequestRecord,
    begin_key: String,
) -> Result<Response> {
    let finished = stored.timestamps.contains_key(&ctx.kind.end_key());
    let failed = stored.status == Some(RequestStatus::Error);

    if finished && !failed && stored.status != Some(RequestStatus::Completed) {
        if let Some(next) = &ctx.next {
            ctx.queue.add(next, &stored).await?;
            debug!(next = %next.target_service, "Re-enqueued committed record for duplicate task");
        }
    }

    Err(PipelineError::TimestampKeyExists { key: begin_key })
}

/// Persist the terminal error state and hand back the original failure
async fn fail_request(
    ctx: &StageContext,
    mut record: RequestRecord,
    err: PipelineError,
    persist: bool,
) -> PipelineError {
    record.status = Some(RequestStatus::Error);
    record.original_status = Some(i32::from(err.status_code().as_u16()));
    if let Err(e) = record.set_timestamp(ctx.kind.end_key(), Timestamp::now()) {
        return e;
    }

    if persist {
        if let Err(e) = ctx.repository.update(&record).await {
            warn!("Failed to persist error state: {}", e);
            return e.into();
        }
    }

    info!(original_status = ?record.original_status, "Request terminated: {}", err);
    err
}
