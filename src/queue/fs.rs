//! Filesystem queue for development
//!
//! Each task is written as one JSON envelope under
//! `<spool>/<queue>/<enqueue nanos>-<task>.json`. Nothing delivers them;
//! they are inspected or replayed by hand.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Queue, QueueError, QueueInfo};
use crate::error::Cause;
use crate::pipeline::{RequestRecord, Timestamp};

/// Envelope stored for each spooled task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpooledTask {
    pub task_name: String,
    pub queue: String,
    pub target_service: String,
    pub handler_url: String,
    pub enqueued_at: Timestamp,
    pub record: RequestRecord,
}

pub struct FsQueue {
    spool_dir: PathBuf,
}

impl FsQueue {
    pub fn new(spool_dir: PathBuf) -> Self {
        Self { spool_dir }
    }

    pub fn queue_dir(&self, queue: &str) -> PathBuf {
        self.spool_dir.join(queue)
    }

    /// Spooled tasks of a queue, oldest first
    pub async fn list(&self, queue: &str) -> std::io::Result<Vec<SpooledTask>> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(self.queue_dir(queue)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut tasks = Vec::with_capacity(paths.len());
        for path in paths {
            let content = tokio::fs::read(&path).await?;
            let task = serde_json::from_slice(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

fn valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    let metadata = tokio::fs::metadata(dir).await?;
    if !metadata.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }
    if metadata.permissions().readonly() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{} is read-only", dir.display()),
        ));
    }
    Ok(())
}

#[async_trait]
impl Queue for FsQueue {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn create(&self, info: &QueueInfo) -> Result<(), QueueError> {
        if !valid_queue_name(&info.name) {
            return Err(QueueError::Create {
                queue: info.name.clone(),
                cause: "queue names may only use letters, digits, '-' and '_'".into(),
            });
        }
        tokio::fs::create_dir_all(self.queue_dir(&info.name))
            .await
            .map_err(|e| QueueError::Create {
                queue: info.name.clone(),
                cause: Box::new(e),
            })
    }

    async fn connect(&self, info: &QueueInfo) -> Result<(), QueueError> {
        ensure_writable(&self.queue_dir(&info.name))
            .await
            .map_err(|e| QueueError::Connect {
                queue: info.name.clone(),
                cause: Box::new(e),
            })
    }

    async fn add(&self, info: &QueueInfo, record: &RequestRecord) -> Result<String, QueueError> {
        let task_name = info.task_name(record);
        let add_error = |cause: Cause| QueueError::Add {
            queue: info.name.clone(),
            task: task_name.clone(),
            cause,
        };

        self.create(info).await?;

        let enqueued_at = Timestamp::now();
        let envelope = SpooledTask {
            task_name: task_name.clone(),
            queue: info.name.clone(),
            target_service: info.target_service.clone(),
            handler_url: info.handler_url.clone(),
            enqueued_at,
            record: record.clone(),
        };
        let content = serde_json::to_vec_pretty(&envelope).map_err(|e| add_error(Box::new(e)))?;

        let nanos = enqueued_at
            .as_datetime()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let dir = self.queue_dir(&info.name);
        let path = dir.join(format!("{:020}-{}.json", nanos, task_name));
        let partial = dir.join(format!(".{:020}-{}.json.tmp", nanos, task_name));

        tokio::fs::write(&partial, &content)
            .await
            .map_err(|e| add_error(Box::new(e)))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| add_error(Box::new(e)))?;

        tracing::debug!(queue = %info.name, task = %task_name, path = %path.display(), "Task spooled");
        Ok(task_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn info(name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            target_service: "transcription".to_string(),
            handler_url: "http://127.0.0.1:8082/task_handler".to_string(),
        }
    }

    #[tokio::test]
    async fn spooled_tasks_keep_order_and_content() {
        let tmp = tempdir().unwrap();
        let queue = FsQueue::new(tmp.path().to_path_buf());
        let info = info("transcription-queue");

        queue.create(&info).await.unwrap();
        queue.connect(&info).await.unwrap();

        let first = RequestRecord::accept(1, "gs://b/one.mp3".to_string());
        let second = RequestRecord::accept(2, "gs://b/two.mp3".to_string());
        queue.add(&info, &first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        queue.add(&info, &second).await.unwrap();

        let tasks = queue.list(&info.name).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].record, first);
        assert_eq!(tasks[1].record, second);
        assert_eq!(tasks[0].task_name, info.task_name(&first));
    }

    #[tokio::test]
    async fn connect_fails_before_create() {
        let tmp = tempdir().unwrap();
        let queue = FsQueue::new(tmp.path().to_path_buf());
        assert!(queue.connect(&info("missing")).await.is_err());
    }

    #[tokio::test]
    async fn path_like_queue_names_are_rejected() {
        let tmp = tempdir().unwrap();
        let queue = FsQueue::new(tmp.path().to_path_buf());
        assert!(queue.create(&info("../escape")).await.is_err());
    }
}
