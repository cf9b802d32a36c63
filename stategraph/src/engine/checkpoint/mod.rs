//! Checkpointing for suspend/resume and crash recovery
//!
//! A checkpoint captures the execution state of one thread after a node step,
//! together with the node the walk continues at. The runtime reads the latest
//! checkpoint of a thread when a run starts and writes one after steps,
//! on suspension, and on completion.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Checkpointer                 │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐  │
//! │  │  Memory  │   │   File   │   │  SQLite  │  │
//! │  └──────────┘   └──────────┘   └──────────┘  │
//! │        └──────────────┼──────────────┘       │
//! │                       ▼                      │
//! │     Checkpoint { thread_id, step, state }    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Backends are keyed by thread id and keep a history of steps per thread.
//! Only one writer per thread is assumed.

mod file;
#[cfg(feature = "checkpointer-sqlite")]
mod sqlite;

pub use file::FileCheckpointer;
#[cfg(feature = "checkpointer-sqlite")]
pub use sqlite::SqliteCheckpointer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::RunError;
use crate::state::ExecutionState;

/// Persisted state of one thread at a step boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,

    /// Value of `state.step` when the checkpoint was taken
    pub step: usize,

    pub state: ExecutionState,

    /// Node the walk continues at; `None` once the run reached END
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node: Option<String>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Checkpoint {
    pub fn new(thread_id: impl Into<String>, state: ExecutionState, next_node: Option<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            step: state.step,
            state,
            next_node,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the thread finished its last run
    pub fn is_complete(&self) -> bool {
        self.next_node.is_none() && self.state.interrupt.is_none()
    }

    /// Whether the thread is waiting for a resume value
    pub fn is_suspended(&self) -> bool {
        self.state.interrupt.is_some()
    }
}

/// Durable storage of checkpoints keyed by thread id.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Save a checkpoint, replacing any checkpoint at the same thread and step.
    ///
    /// Implementations should ensure atomic writes to prevent corruption.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RunError>;

    /// Latest checkpoint of `thread_id`, if any
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, RunError>;

    /// Checkpoint of `thread_id` at `step`, if any
    async fn load_step(&self, thread_id: &str, step: usize) -> Result<Option<Checkpoint>, RunError>;

    /// Steps stored for `thread_id`, ascending
    async fn history(&self, thread_id: &str) -> Result<Vec<usize>, RunError>;

    /// Delete every checkpoint of `thread_id`
    async fn delete(&self, thread_id: &str) -> Result<(), RunError>;

    /// Delete one step of `thread_id`
    async fn delete_step(&self, thread_id: &str, step: usize) -> Result<(), RunError>;

    /// Threads with at least one checkpoint
    async fn threads(&self) -> Result<Vec<String>, RunError>;

    /// Keep only the `keep` most recent steps of `thread_id`; returns how many were deleted
    async fn prune(&self, thread_id: &str, keep: usize) -> Result<usize, RunError> {
        let steps = self.history(thread_id).await?;
        let to_delete = steps.len().saturating_sub(keep);
        for step in steps.iter().take(to_delete) {
            self.delete_step(thread_id, *step).await?;
        }
        Ok(to_delete)
    }
}

/// `checkpoint:` block of a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointerConfig {
    /// In-memory checkpointing (not durable)
    #[default]
    Memory,

    /// One JSON file per step under `path/<thread>/`
    File {
        path: PathBuf,
        /// Compress checkpoint files with zstd
        #[serde(default)]
        compression: bool,
    },

    /// SQLite database (requires the `checkpointer-sqlite` feature)
    Sqlite {
        /// Database file, or `:memory:`
        path: String,
        #[serde(default)]
        compression: bool,
    },
}

/// In-memory checkpointer.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    threads: tokio::sync::RwLock<HashMap<String, BTreeMap<usize, Checkpoint>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RunError> {
        let mut threads = self.threads.write().await;
        threads
            .entry(checkpoint.thread_id.clone())
            .or_default()
            .insert(checkpoint.step, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, RunError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .and_then(|steps| steps.values().next_back())
            .cloned())
    }

    async fn load_step(&self, thread_id: &str, step: usize) -> Result<Option<Checkpoint>, RunError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).and_then(|steps| steps.get(&step)).cloned())
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<usize>, RunError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|steps| steps.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, thread_id: &str) -> Result<(), RunError> {
        self.threads.write().await.remove(thread_id);
        Ok(())
    }

    async fn delete_step(&self, thread_id: &str, step: usize) -> Result<(), RunError> {
        let mut threads = self.threads.write().await;
        if let Some(steps) = threads.get_mut(thread_id) {
            steps.remove(&step);
            if steps.is_empty() {
                threads.remove(thread_id);
            }
        }
        Ok(())
    }

    async fn threads(&self) -> Result<Vec<String>, RunError> {
        let mut ids: Vec<String> = self.threads.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Create a checkpointer from a `checkpoint:` block.
pub async fn create_checkpointer(config: &CheckpointerConfig) -> Result<Arc<dyn Checkpointer>, RunError> {
    match config {
        CheckpointerConfig::Memory => Ok(Arc::new(MemoryCheckpointer::new())),

        CheckpointerConfig::File { path, compression } => {
            Ok(Arc::new(FileCheckpointer::new(path.clone(), *compression)))
        }

        #[cfg(feature = "checkpointer-sqlite")]
        CheckpointerConfig::Sqlite { path, compression } => {
            let checkpointer = SqliteCheckpointer::with_compression(path, *compression).await?;
            Ok(Arc::new(checkpointer))
        }

        #[cfg(not(feature = "checkpointer-sqlite"))]
        CheckpointerConfig::Sqlite { .. } => Err(RunError::checkpoint(
            "sqlite checkpointing requires the `checkpointer-sqlite` feature",
        )),
    }
}

/// Compress data using zstd
pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>, RunError> {
    let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3)
        .map_err(|e| RunError::checkpoint(format!("Compression init failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| RunError::checkpoint(format!("Compression write failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| RunError::checkpoint(format!("Compression finish failed: {}", e)))
}

/// Decompress data using zstd
pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>, RunError> {
    zstd::stream::decode_all(data)
        .map_err(|e| RunError::checkpoint(format!("Decompression failed: {}", e)))
}
