//! Task queues between stages
//!
//! A task is a serialized request record addressed to the handler endpoint
//! of the next stage. Backends share the `{create, connect, add}` capability
//! set and are chosen by configuration at startup.

mod delivery;
mod durable;
mod fs;
mod null;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Settings;
use crate::error::{Cause, PipelineError};
use crate::pipeline::{RequestRecord, StageKind};

pub use delivery::{classify_status, Deliverer, DeliveryOutcome, RetryPolicy};
pub use durable::{DurableQueue, QueueStats, TaskState};
pub use fs::{FsQueue, SpooledTask};
pub use null::NullQueue;

/// Queue implementation selected at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// SQLite task table drained by the deliverer
    #[default]
    Durable,
    /// One JSON file per task under the spool directory
    Filesystem,
    /// Accepts and discards every task
    Null,
}

impl QueueBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Filesystem => "filesystem",
            Self::Null => "null",
        }
    }
}

/// Address of a queue and the service its tasks are delivered to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub target_service: String,
    pub handler_url: String,
}

impl QueueInfo {
    /// Queue a stage writes to, resolved from its route.
    ///
    /// Returns `None` for a stage with no successor.
    pub fn for_stage(settings: &Settings, kind: StageKind) -> anyhow::Result<Option<Self>> {
        let route = settings.route(kind)?;
        match (&route.write_to_q, &route.next_svc) {
            (Some(name), Some(next)) => Ok(Some(Self {
                name: name.clone(),
                target_service: next.clone(),
                handler_url: settings.handler_url(next)?,
            })),
            (None, None) => Ok(None),
            _ => anyhow::bail!(
                "Stage '{}' must set both write_to_q and next_svc, or neither",
                kind
            ),
        }
    }

    /// One task per request per hop
    pub fn task_name(&self, record: &RequestRecord) -> String {
        format!("{}-{}", record.request_id, self.target_service)
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("failed to create queue {queue}: {cause}")]
    Create {
        queue: String,
        #[source]
        cause: Cause,
    },

    #[error("queue {queue} is not reachable: {cause}")]
    Connect {
        queue: String,
        #[source]
        cause: Cause,
    },

    #[error("failed to add task {task} to queue {queue}: {cause}")]
    Add {
        queue: String,
        task: String,
        #[source]
        cause: Cause,
    },

    #[error("failed to deliver task {task}: {cause}")]
    Delivery {
        task: String,
        #[source]
        cause: Cause,
    },
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        let message = err.to_string();
        PipelineError::transient(message, err)
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Make sure the queue exists. Idempotent.
    async fn create(&self, info: &QueueInfo) -> Result<(), QueueError>;

    /// Verify the queue can accept tasks
    async fn connect(&self, info: &QueueInfo) -> Result<(), QueueError>;

    /// Durably enqueue the record; returns the task name
    async fn add(&self, info: &QueueInfo, record: &RequestRecord) -> Result<String, QueueError>;
}

/// Build the queue backend selected by the settings
pub fn create_queue(settings: &Settings) -> anyhow::Result<Arc<dyn Queue>> {
    let queue: Arc<dyn Queue> = match settings.queue.backend {
        QueueBackend::Durable => Arc::new(DurableQueue::open(&settings.queue_database_path())?),
        QueueBackend::Filesystem => Arc::new(FsQueue::new(settings.spool_dir())),
        QueueBackend::Null => Arc::new(NullQueue),
    };
    tracing::debug!(backend = queue.backend_name(), "Created task queue");
    Ok(queue)
}
