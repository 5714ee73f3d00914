//! Request repository: create, find-by-id and update-with-merge
//!
//! Documents are stored without their `request_id`; the key is the id's
//! string form and is put back on every read.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{Cause, PipelineError};
use crate::pipeline::{RequestRecord, Timestamp};
use crate::storage::Database;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("request id must not be zero")]
    ZeroId,

    #[error("no request document for id {0}")]
    NotFound(Uuid),

    #[error("failed to create request document: {0}")]
    Create(#[source] Cause),

    #[error("failed to read request document: {0}")]
    Find(#[source] Cause),

    #[error("failed to update request document: {0}")]
    Update(#[source] Cause),

    #[error("timestamps key already exists: {key}")]
    TimestampKeyExists { key: String },
}

impl From<RepositoryError> for PipelineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::ZeroId => PipelineError::identity(err.to_string()),
            RepositoryError::NotFound(_) => PipelineError::NotFound(err.to_string()),
            RepositoryError::TimestampKeyExists { key } => PipelineError::TimestampKeyExists { key },
            RepositoryError::Create(_) | RepositoryError::Find(_) | RepositoryError::Update(_) => {
                let message = err.to_string();
                PipelineError::transient(message, err)
            }
        }
    }
}

/// Persistent storage for request records
#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// Persist the full record, overwriting any document with the same id
    async fn create(&self, record: &RequestRecord) -> Result<(), RepositoryError>;

    /// Load a record; `request_id` is re-populated from the key
    async fn find_by_id(&self, id: Uuid) -> Result<RequestRecord, RepositoryError>;

    /// Merge the supplied fields into the stored record and return the result
    async fn update(&self, record: &RequestRecord) -> Result<RequestRecord, RepositoryError>;
}

/// Merge an update into a stored record.
///
/// Fields present in the update overwrite their stored counterparts, except
/// `accepted_at`, which keeps its first value. Timestamps merge key by key
/// and a key may not change once stored. `updated_at` is always refreshed.
pub fn merge_update(
    mut stored: RequestRecord,
    update: &RequestRecord,
    now: Timestamp,
) -> Result<RequestRecord, RepositoryError> {
    for (key, at) in &update.timestamps {
        match stored.timestamps.get(key) {
            Some(existing) if existing != at => {
                return Err(RepositoryError::TimestampKeyExists { key: key.clone() });
            }
            Some(_) => {}
            None => {
                stored.timestamps.insert(key.clone(), *at);
            }
        }
    }

    macro_rules! overwrite {
        ($($field:ident),+) => {
            $(if update.$field.is_some() {
                stored.$field = update.$field.clone();
            })+
        };
    }
    overwrite!(
        customer_id,
        media_uri,
        status,
        original_status,
        completed_at,
        working_transcript,
        final_transcript
    );

    if stored.accepted_at.is_none() {
        stored.accepted_at = update.accepted_at;
    }
    if !update.matched_tags.is_empty() {
        stored.matched_tags = update.matched_tags.clone();
    }

    stored.request_id = update.request_id;
    stored.updated_at = Some(now);
    Ok(stored)
}

/// Repository over the SQLite document table
#[derive(Clone)]
pub struct SqliteRepository {
    db: Arc<Mutex<Database>>,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn with_db<T, F>(&self, op: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T, RepositoryError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| RepositoryError::Find("database lock poisoned".into()))?;
            op(&mut *guard)
        })
        .await
        .map_err(|e| RepositoryError::Find(Box::new(e)))?
    }
}

fn encode(record: &RequestRecord) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(record)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("request_id");
    }
    serde_json::to_string(&value)
}

fn decode(id: Uuid, body: &str) -> serde_json::Result<RequestRecord> {
    let mut record: RequestRecord = serde_json::from_str(body)?;
    record.request_id = id;
    Ok(record)
}

#[async_trait]
impl RequestRepository for SqliteRepository {
    async fn create(&self, record: &RequestRecord) -> Result<(), RepositoryError> {
        if record.has_zero_id() {
            return Err(RepositoryError::ZeroId);
        }

        let id = record.request_id.to_string();
        let body = encode(record).map_err(|e| RepositoryError::Create(Box::new(e)))?;
        let now = Timestamp::now().to_string();

        self.with_db(move |db| {
            db.put_document(&id, &body, &now)
                .map_err(|e| RepositoryError::Create(e.into()))
        })
        .await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<RequestRecord, RepositoryError> {
        if id.is_nil() {
            return Err(RepositoryError::ZeroId);
        }

        let document = self
            .with_db(move |db| {
                db.get_document(&id.to_string())
                    .map_err(|e| RepositoryError::Find(e.into()))
            })
            .await?
            .ok_or(RepositoryError::NotFound(id))?;

        decode(id, &document.body).map_err(|e| RepositoryError::Find(Box::new(e)))
    }

    async fn update(&self, record: &RequestRecord) -> Result<RequestRecord, RepositoryError> {
        if record.has_zero_id() {
            return Err(RepositoryError::ZeroId);
        }

        let update = record.clone();
        let id = update.request_id;

        let body = self
            .with_db(move |db| {
                let now = Timestamp::now();
                db.modify_document(&id.to_string(), &now.to_string(), |stored| {
                    let stored = match stored {
                        Some(body) => decode(id, body)
                            .map_err(|e| RepositoryError::Update(Box::new(e)))?,
                        None => RequestRecord::default(),
                    };
                    let merged = merge_update(stored, &update, now)?;
                    encode(&merged).map_err(|e| RepositoryError::Update(Box::new(e)))
                })
            })
            .await?;

        decode(id, &body).map_err(|e| RepositoryError::Update(Box::new(e)))
    }
}

impl From<anyhow::Error> for RepositoryError {
    fn from(err: anyhow::Error) -> Self {
        RepositoryError::Update(err.into())
    }
}
