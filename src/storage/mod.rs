//! Storage module for callscribe
//!
//! Request records are kept as JSON documents in a SQLite collection table.

mod database;
mod repository;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::Settings;

pub use database::{Database, StoredDocument};
pub use repository::{merge_update, RepositoryError, RequestRepository, SqliteRepository};

/// Where request documents live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite file under the data directory, shared by every stage process
    #[default]
    Sqlite,
    /// Process-local in-memory database
    Memory,
}

/// Open the repository selected by the settings
pub fn open_repository(settings: &Settings) -> Result<Arc<dyn RequestRepository>> {
    let db = match settings.storage.backend {
        StorageBackend::Sqlite => Database::open(settings)?,
        StorageBackend::Memory => Database::open_memory(&settings.storage.collection)?,
    };
    tracing::debug!(
        backend = ?settings.storage.backend,
        collection = db.collection(),
        "Opened request storage"
    );
    Ok(Arc::new(SqliteRepository::new(db)))
}
