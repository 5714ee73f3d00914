//! Client-facing request intake

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::error::{PipelineError, Result};
use crate::pipeline::{RequestRecord, Timestamp};
use crate::queue::{Queue, QueueInfo};
use crate::storage::{RepositoryError, RequestRepository};

pub const REQUESTS_PATH: &str = "/api/v1/requests";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    #[validate(range(min = 1, max = 9_999_999))]
    pub customer_id: i64,

    #[validate(url)]
    pub media_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub request_id: Uuid,
    pub customer_id: i64,
    pub media_uri: String,
    pub accepted_at: Timestamp,
    pub poll_endpoint: String,
}

pub fn poll_endpoint(id: Uuid) -> String {
    format!("{}/{}", REQUESTS_PATH, id)
}

/// Accepts new requests and answers status polls
pub struct IngressService {
    repository: Arc<dyn RequestRepository>,
    queue: Arc<dyn Queue>,
    first: QueueInfo,
}

impl IngressService {
    pub fn new(
        repository: Arc<dyn RequestRepository>,
        queue: Arc<dyn Queue>,
        first: QueueInfo,
    ) -> Self {
        Self {
            repository,
            queue,
            first,
        }
    }

    /// Validate, assign identity, persist and hand the request to the first queue
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse> {
        request
            .validate()
            .map_err(|errors| PipelineError::validation(format!("invalid request: {}", errors)))?;

        let record = RequestRecord::accept(request.customer_id, request.media_uri);

        self.repository
            .create(&record)
            .await
            .map_err(|e| transport_failure("failed to persist request", e))?;

        let task = self
            .queue
            .add(&self.first, &record)
            .await
            .map_err(|e| transport_failure("failed to enqueue request", e))?;

        info!(
            request_id = %record.request_id,
            customer_id = request.customer_id,
            queue = %self.first.name,
            task = %task,
            "Request accepted"
        );

        Ok(SubmitResponse {
            request_id: record.request_id,
            customer_id: request.customer_id,
            media_uri: record.media_uri.unwrap_or_default(),
            accepted_at: record.accepted_at.unwrap_or_else(Timestamp::now),
            poll_endpoint: poll_endpoint(record.request_id),
        })
    }

    /// Current persisted state of a request
    pub async fn status(&self, id: Uuid) -> Result<RequestRecord> {
        if id.is_nil() {
            return Err(PipelineError::validation("request id must not be zero"));
        }
        match self.repository.find_by_id(id).await {
            Ok(record) => Ok(record),
            Err(RepositoryError::NotFound(_)) => {
                Err(PipelineError::NotFound(format!("request {}", id)))
            }
            Err(e) => Err(transport_failure("failed to read request", e)),
        }
    }
}

fn transport_failure<E>(message: &str, err: E) -> PipelineError
where
    E: std::error::Error + Send + Sync + 'static,
{
    PipelineError::Internal {
        message: format!("{}: {}", message, err),
        cause: Some(Box::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestStatus;
    use crate::queue::NullQueue;
    use crate::storage::{Database, SqliteRepository};

    fn service() -> (IngressService, Arc<dyn RequestRepository>) {
        let repository: Arc<dyn RequestRepository> = Arc::new(SqliteRepository::new(
            Database::open_memory("requests").unwrap(),
        ));
        let first = QueueInfo {
            name: "dispatch-queue".to_string(),
            target_service: "dispatch".to_string(),
            handler_url: "http://127.0.0.1:8081/task_handler".to_string(),
        };
        (
            IngressService::new(repository.clone(), Arc::new(NullQueue), first),
            repository,
        )
    }

    #[tokio::test]
    async fn submit_persists_pending_record() {
        let (service, repository) = service();
        let response = service
            .submit(SubmitRequest {
                customer_id: 1_234_567,
                media_uri: "gs://b/audio-01.mp3".to_string(),
            })
            .await
            .unwrap();

        assert!(!response.request_id.is_nil());
        assert_eq!(response.poll_endpoint, poll_endpoint(response.request_id));

        let stored = repository.find_by_id(response.request_id).await.unwrap();
        assert_eq!(stored.status, Some(RequestStatus::Pending));
        assert_eq!(stored.accepted_at, Some(response.accepted_at));
        assert_eq!(stored.customer_id, Some(1_234_567));
    }

    #[tokio::test]
    async fn out_of_range_customer_is_rejected() {
        let (service, _) = service();
        let err = service
            .submit(SubmitRequest {
                customer_id: 10_000_000,
                media_uri: "gs://b/audio-01.mp3".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_distinguishes_missing_and_zero_ids() {
        let (service, _) = service();
        assert!(matches!(
            service.status(Uuid::new_v4()).await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            service.status(Uuid::nil()).await,
            Err(PipelineError::Validation { .. })
        ));
    }
}
