//! Persistence layer - SQLite key-value documents
//!
//! The thread list and the settings document are each stored as one JSON
//! document. Uses `spawn_blocking` for async-safe SQLite access.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::config::Settings;
use crate::thread::Thread;

const THREADS_KEY: &str = "threads";
const SETTINGS_KEY: &str = "settings";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document {key} is not valid: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(String),
}

#[async_trait]
pub trait PersistenceCollaborator: Send + Sync {
    async fn load_threads(&self) -> Result<Vec<Thread>, StoreError>;
    async fn save_threads(&self, threads: &[Thread]) -> Result<(), StoreError>;
    /// Stored settings, or `None` on first start.
    async fn load_settings(&self) -> Result<Option<Settings>, StoreError>;
    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError>;
}

/// `PersistenceCollaborator` over a single-table SQLite database.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = connect(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        info!(
            component = "persistence",
            event = "persistence.opened",
            db_path = %db_path.display(),
            "Document store ready"
        );
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    async fn read(&self, key: &'static str) -> Result<Option<String>, StoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connect(&db_path)?;
            let value = conn
                .query_row(
                    "SELECT value FROM documents WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn write(&self, key: &'static str, value: String) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let bytes = value.len();
        tokio::task::spawn_blocking(move || {
            let conn = connect(&db_path)?;
            conn.execute(
                "INSERT INTO documents (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok::<_, StoreError>(())
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;
        debug!(
            component = "persistence",
            event = "persistence.saved",
            key,
            bytes,
            "Document saved"
        );
        Ok(())
    }
}

fn connect(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}

#[async_trait]
impl PersistenceCollaborator for SqliteStore {
    async fn load_threads(&self) -> Result<Vec<Thread>, StoreError> {
        match self.read(THREADS_KEY).await? {
            Some(raw) => decode(THREADS_KEY, &raw),
            None => Ok(Vec::new()),
        }
    }

    async fn save_threads(&self, threads: &[Thread]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(threads).map_err(StoreError::Encode)?;
        self.write(THREADS_KEY, raw).await
    }

    async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        match self.read(SETTINGS_KEY).await? {
            Some(raw) => decode(SETTINGS_KEY, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let raw = serde_json::to_string(settings).map_err(StoreError::Encode)?;
        self.write(SETTINGS_KEY, raw).await
    }
}
