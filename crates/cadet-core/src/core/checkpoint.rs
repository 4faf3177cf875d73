//! Conversation checkpoints.
//!
//! Each completed run appends a row holding the serialized conversation. The
//! newest row per thread is what `load` returns; older rows are kept as a
//! short history and pruned past [`KEEP_PER_THREAD`].

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::core::conversation::Conversation;

/// Rows retained per thread after each save.
pub const KEEP_PER_THREAD: i64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("checkpoint payload is not a valid conversation: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("create checkpoint directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Latest checkpoint of one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub thread_id: String,
    pub message_count: usize,
    /// RFC 3339 timestamp of the latest save.
    pub saved_at: String,
    /// Rows currently kept for the thread.
    pub revisions: usize,
}

/// Durable storage keyed by thread id.
pub trait CheckpointStore: Send {
    /// Persists `conversation` as the newest checkpoint of `thread_id`.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    fn save(&mut self, thread_id: &str, conversation: &Conversation) -> Result<(), CheckpointError>;

    /// Returns the newest checkpoint, or `None` if the thread was never saved.
    ///
    /// # Errors
    /// Returns an error if the read fails or the payload does not decode.
    fn load(&self, thread_id: &str) -> Result<Option<Conversation>, CheckpointError>;
}

/// SQLite-backed store. The connection is held until the store is dropped.
pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    /// Opens (or creates) the database at `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the directory or database cannot be created.
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                message_count INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
                ON checkpoints (thread_id, id);",
        )?;
        Ok(Self { conn })
    }

    /// Latest checkpoint of every thread, most recently saved first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.thread_id, c.message_count, c.saved_at,
                    (SELECT COUNT(*) FROM checkpoints h WHERE h.thread_id = c.thread_id)
             FROM checkpoints c
             WHERE c.id IN (SELECT MAX(id) FROM checkpoints GROUP BY thread_id)
             ORDER BY c.id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CheckpointSummary {
                thread_id: row.get(0)?,
                message_count: row.get::<_, i64>(1)? as usize,
                saved_at: row.get(2)?,
                revisions: row.get::<_, i64>(3)? as usize,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Deletes every checkpoint of `thread_id`; returns the number of rows removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn clear(&mut self, thread_id: &str) -> Result<usize, CheckpointError> {
        Ok(self
            .conn
            .execute("DELETE FROM checkpoints WHERE thread_id = ?1", params![thread_id])?)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&mut self, thread_id: &str, conversation: &Conversation) -> Result<(), CheckpointError> {
        let payload = serde_json::to_string(conversation)?;
        let saved_at = chrono::Utc::now().to_rfc3339();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO checkpoints (thread_id, saved_at, message_count, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![thread_id, saved_at, conversation.len() as i64, payload],
        )?;
        tx.execute(
            "DELETE FROM checkpoints
             WHERE thread_id = ?1
               AND id NOT IN (
                   SELECT id FROM checkpoints WHERE thread_id = ?1 ORDER BY id DESC LIMIT ?2
               )",
            params![thread_id, KEEP_PER_THREAD],
        )?;
        tx.commit()?;

        tracing::debug!(thread_id, messages = conversation.len(), "checkpoint saved");
        Ok(())
    }

    fn load(&self, thread_id: &str) -> Result<Option<Conversation>, CheckpointError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM checkpoints WHERE thread_id = ?1 ORDER BY id DESC LIMIT 1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p).map_err(CheckpointError::from))
            .transpose()
    }
}
