//! SQLite-based checkpointer
//!
//! Stores checkpoints in a SQLite database, one row per thread and step.
//! Supports both file-based and in-memory databases.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS checkpoints (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     thread_id TEXT NOT NULL,
//!     step INTEGER NOT NULL,
//!     data BLOB NOT NULL,
//!     created_at TEXT NOT NULL,
//!     UNIQUE(thread_id, step)
//! );
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio_rusqlite::Connection;

use super::{compress, decompress, Checkpoint, Checkpointer};
use crate::error::RunError;

/// SQLite-backed checkpointer.
#[derive(Debug)]
pub struct SqliteCheckpointer {
    conn: Arc<Connection>,
    compression: bool,
}

impl SqliteCheckpointer {
    /// Open (or create) the database at `path`; `:memory:` for an in-memory database
    pub async fn new(path: impl AsRef<str>) -> Result<Self, RunError> {
        Self::with_compression(path, false).await
    }

    pub async fn with_compression(path: impl AsRef<str>, compression: bool) -> Result<Self, RunError> {
        let path = path.as_ref().to_string();

        let conn = Connection::open(&path)
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to open SQLite: {}", e)))?;

        conn.call(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id TEXT NOT NULL,
                    step INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(thread_id, step)
                );
                CREATE INDEX IF NOT EXISTS idx_thread_step
                    ON checkpoints(thread_id, step);
                "#,
            )?;
            Ok(())
        })
        .await
        .map_err(|e| RunError::checkpoint(format!("Failed to create schema: {}", e)))?;

        Ok(Self {
            conn: Arc::new(conn),
            compression,
        })
    }

    fn decode(&self, data: Vec<u8>) -> Result<Checkpoint, RunError> {
        let json = if self.compression { decompress(&data)? } else { data };
        serde_json::from_slice(&json)
            .map_err(|e| RunError::checkpoint(format!("Deserialization failed: {}", e)))
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RunError> {
        let json = serde_json::to_vec(checkpoint)
            .map_err(|e| RunError::checkpoint(format!("Serialization failed: {}", e)))?;
        let data = if self.compression { compress(&json)? } else { json };

        let thread_id = checkpoint.thread_id.clone();
        let step = checkpoint.step as i64;
        let created_at = checkpoint.timestamp.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO checkpoints (thread_id, step, data, created_at)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    rusqlite::params![thread_id, step, data, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to save checkpoint: {}", e)))
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, RunError> {
        let thread_id = thread_id.to_string();
        let data = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM checkpoints WHERE thread_id = ?1 ORDER BY step DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![thread_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, Vec<u8>>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to load checkpoint: {}", e)))?;

        data.map(|data| self.decode(data)).transpose()
    }

    async fn load_step(&self, thread_id: &str, step: usize) -> Result<Option<Checkpoint>, RunError> {
        let thread_id = thread_id.to_string();
        let data = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT data FROM checkpoints WHERE thread_id = ?1 AND step = ?2")?;
                let mut rows = stmt.query(rusqlite::params![thread_id, step as i64])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, Vec<u8>>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to load checkpoint: {}", e)))?;

        data.map(|data| self.decode(data)).transpose()
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<usize>, RunError> {
        let thread_id = thread_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT step FROM checkpoints WHERE thread_id = ?1 ORDER BY step")?;
                let steps = stmt
                    .query_map(rusqlite::params![thread_id], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(steps.into_iter().map(|s| s as usize).collect())
            })
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to list checkpoints: {}", e)))
    }

    async fn delete(&self, thread_id: &str) -> Result<(), RunError> {
        let thread_id = thread_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM checkpoints WHERE thread_id = ?1",
                    rusqlite::params![thread_id],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to delete checkpoints: {}", e)))
    }

    async fn delete_step(&self, thread_id: &str, step: usize) -> Result<(), RunError> {
        let thread_id = thread_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM checkpoints WHERE thread_id = ?1 AND step = ?2",
                    rusqlite::params![thread_id, step as i64],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to delete checkpoint: {}", e)))
    }

    async fn threads(&self) -> Result<Vec<String>, RunError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")?;
                let threads = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(threads)
            })
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to list threads: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutionState;
    use serde_json::json;

    fn checkpoint(thread: &str, step: usize) -> Checkpoint {
        let mut state = ExecutionState::from_value(json!({"n": step})).unwrap();
        state.step = step;
        Checkpoint::new(thread, state, Some("next".into()))
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_history() {
        let checkpointer = SqliteCheckpointer::new(":memory:").await.unwrap();
        for step in [2, 1, 3] {
            checkpointer.save(&checkpoint("a", step)).await.unwrap();
        }
        checkpointer.save(&checkpoint("b", 1)).await.unwrap();

        let latest = checkpointer.load("a").await.unwrap().unwrap();
        assert_eq!(latest.step, 3);
        assert_eq!(latest.state.values["n"], json!(3));
        assert_eq!(checkpointer.history("a").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(checkpointer.threads().await.unwrap(), vec!["a", "b"]);

        checkpointer.delete("a").await.unwrap();
        assert!(checkpointer.load("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_compressed() {
        let checkpointer = SqliteCheckpointer::with_compression(":memory:", true)
            .await
            .unwrap();
        let original = checkpoint("t", 7);
        checkpointer.save(&original).await.unwrap();
        assert_eq!(checkpointer.load_step("t", 7).await.unwrap(), Some(original));
    }
}
