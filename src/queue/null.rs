//! Queue that accepts and discards every task

use async_trait::async_trait;

use super::{Queue, QueueError, QueueInfo};
use crate::pipeline::RequestRecord;

#[derive(Debug, Clone, Copy, Default)]
pub struct NullQueue;

#[async_trait]
impl Queue for NullQueue {
    fn backend_name(&self) -> &'static str {
        "null"
    }

    async fn create(&self, _info: &QueueInfo) -> Result<(), QueueError> {
        Ok(())
    }

    async fn connect(&self, _info: &QueueInfo) -> Result<(), QueueError> {
        Ok(())
    }

    async fn add(&self, info: &QueueInfo, record: &RequestRecord) -> Result<String, QueueError> {
        let task = info.task_name(record);
        tracing::debug!(queue = %info.name, task = %task, "Discarding task");
        Ok(task)
    }
}
