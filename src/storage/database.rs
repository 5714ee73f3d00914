//! SQLite document table for request records

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use crate::config::Settings;

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// A stored request document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: String,
    pub body: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Database wrapper holding one collection of JSON documents keyed by id
pub struct Database {
    conn: Connection,
    collection: String,
}

impl Database {
    /// Open or create the database
    pub fn open(settings: &Settings) -> Result<Self> {
        let db_path = settings.database_path();

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Self::open_path(&db_path, &settings.storage.collection)
    }

    /// Open database at a specific path (useful for testing)
    pub fn open_path(path: &Path, collection: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        // Stages run as separate processes sharing one file.
        conn.busy_timeout(Duration::from_secs(5))?;

        Self::with_connection(conn, collection)
    }

    /// Open an in-memory database
    pub fn open_memory(collection: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, collection)
    }

    fn with_connection(conn: Connection, collection: &str) -> Result<Self> {
        if collection.is_empty()
            || !collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!(
                "Invalid collection name '{}': use letters, digits and underscores",
                collection
            );
        }

        let db = Self {
            conn,
            collection: collection.to_string(),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Initialize database schema
    fn initialize(&self) -> Result<()> {
        let current_version = self.schema_version()?;
        if current_version > CURRENT_SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}",
                current_version,
                CURRENT_SCHEMA_VERSION
            );
        }

        // The collection table is created unconditionally so a renamed
        // collection in an existing file still gets its table.
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_updated_at
                ON {table}(updated_at DESC);
            "#,
            table = self.collection
        ))?;

        if current_version < 1 {
            self.set_schema_version(1)?;
        }

        Ok(())
    }

    /// Current schema version tracked in PRAGMA user_version.
    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))?)
    }

    fn set_schema_version(&self, version: i64) -> Result<()> {
        self.conn
            .execute(&format!("PRAGMA user_version = {}", version), [])?;
        Ok(())
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Insert a document, replacing any document with the same id
    pub fn put_document(&self, id: &str, body: &str, now: &str) -> Result<()> {
        self.conn.execute(
            &format!(
                r#"
                INSERT INTO {} (id, body, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?3)
                ON CONFLICT(id) DO UPDATE SET
                    body = excluded.body,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at
                "#,
                self.collection
            ),
            params![id, body, now],
        )?;
        Ok(())
    }

    /// Get a document by id
    pub fn get_document(&self, id: &str) -> Result<Option<StoredDocument>> {
        let document = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, body, created_at, updated_at FROM {} WHERE id = ?1",
                    self.collection
                ),
                params![id],
                |row| {
                    Ok(StoredDocument {
                        id: row.get(0)?,
                        body: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(document)
    }

    /// Read-modify-write one document inside an immediate transaction.
    ///
    /// `merge` receives the stored body (if any) and returns the new body.
    /// Nothing is written when it fails.
    pub fn modify_document<F, E>(&mut self, id: &str, now: &str, merge: F) -> Result<String, E>
    where
        F: FnOnce(Option<&str>) -> Result<String, E>,
        E: From<anyhow::Error>,
    {
        let select = format!("SELECT body FROM {} WHERE id = ?1", self.collection);
        let upsert = format!(
            r#"
            INSERT INTO {} (id, body, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            self.collection
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(anyhow::Error::from)?;

        let stored: Option<String> = tx
            .query_row(&select, params![id], |row| row.get(0))
            .optional()
            .map_err(anyhow::Error::from)?;

        let body = merge(stored.as_deref())?;

        tx.execute(&upsert, params![id, body, now])
            .map_err(anyhow::Error::from)?;
        tx.commit().map_err(anyhow::Error::from)?;

        Ok(body)
    }

    /// Number of stored documents
    pub fn count_documents(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.collection),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
