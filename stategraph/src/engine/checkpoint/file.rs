//! File-based checkpointer
//!
//! Stores checkpoints as JSON files, optionally zstd-compressed.
//!
//! # Directory Structure
//!
//! ```text
//! checkpoints/
//! └── {thread_id}/
//!     ├── checkpoint_00000001.json[.zst]
//!     ├── checkpoint_00000004.json[.zst]
//!     └── checkpoint_00000005.json[.zst]
//! ```
//!
//! Thread ids are percent-encoded into directory names, since subgraph
//! threads contain `/`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{compress, decompress, Checkpoint, Checkpointer};
use crate::error::RunError;

/// Checkpointer writing one file per thread and step.
///
/// Atomic writes are ensured via temporary file + rename.
#[derive(Debug)]
pub struct FileCheckpointer {
    base_path: PathBuf,
    compression: bool,
}

impl FileCheckpointer {
    pub fn new(base_path: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            base_path: base_path.into(),
            compression,
        }
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.base_path.join(encode_thread_id(thread_id))
    }

    fn checkpoint_path(&self, thread_id: &str, step: usize) -> PathBuf {
        let filename = if self.compression {
            format!("checkpoint_{:08}.json.zst", step)
        } else {
            format!("checkpoint_{:08}.json", step)
        };
        self.thread_path(thread_id).join(filename)
    }

    fn temp_path(&self, thread_id: &str, step: usize) -> PathBuf {
        self.thread_path(thread_id)
            .join(format!("checkpoint_{:08}.tmp", step))
    }

    /// Parse the step number from a checkpoint filename
    fn parse_step(path: &Path) -> Option<usize> {
        let filename = path.file_name()?.to_str()?;
        if filename.ends_with(".tmp") {
            return None;
        }
        filename
            .strip_prefix("checkpoint_")?
            .split('.')
            .next()?
            .parse()
            .ok()
    }

    async fn list_steps(&self, thread_id: &str) -> Result<Vec<usize>, RunError> {
        let dir = self.thread_path(thread_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to read directory: {}", e)))?;

        let mut steps = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to read entry: {}", e)))?
        {
            if let Some(step) = Self::parse_step(&entry.path()) {
                steps.push(step);
            }
        }

        steps.sort_unstable();
        steps.dedup();
        Ok(steps)
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RunError> {
        fs::create_dir_all(self.thread_path(&checkpoint.thread_id))
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to create directory: {}", e)))?;

        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| RunError::checkpoint(format!("Serialization failed: {}", e)))?;
        let data = if self.compression { compress(&json)? } else { json };

        let temp_path = self.temp_path(&checkpoint.thread_id, checkpoint.step);
        let final_path = self.checkpoint_path(&checkpoint.thread_id, checkpoint.step);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to create temp file: {}", e)))?;
        file.write_all(&data)
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to write data: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to sync file: {}", e)))?;

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to rename file: {}", e)))?;

        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, RunError> {
        match self.list_steps(thread_id).await?.last() {
            Some(&step) => self.load_step(thread_id, step).await,
            None => Ok(None),
        }
    }

    async fn load_step(&self, thread_id: &str, step: usize) -> Result<Option<Checkpoint>, RunError> {
        let path = self.checkpoint_path(thread_id, step);
        if !path.exists() {
            return Ok(None);
        }

        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to open file: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to read file: {}", e)))?;

        let json = if self.compression { decompress(&data)? } else { data };
        let checkpoint = serde_json::from_slice(&json)
            .map_err(|e| RunError::checkpoint(format!("Deserialization failed: {}", e)))?;
        Ok(Some(checkpoint))
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<usize>, RunError> {
        self.list_steps(thread_id).await
    }

    async fn delete(&self, thread_id: &str) -> Result<(), RunError> {
        let dir = self.thread_path(thread_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .await
                .map_err(|e| RunError::checkpoint(format!("Failed to delete directory: {}", e)))?;
        }
        Ok(())
    }

    async fn delete_step(&self, thread_id: &str, step: usize) -> Result<(), RunError> {
        let path = self.checkpoint_path(thread_id, step);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .map_err(|e| RunError::checkpoint(format!("Failed to delete file: {}", e)))?;
        }
        Ok(())
    }

    async fn threads(&self) -> Result<Vec<String>, RunError> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to read directory: {}", e)))?;

        let mut threads = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RunError::checkpoint(format!("Failed to read entry: {}", e)))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(thread_id) = decode_thread_id(name) {
                    threads.push(thread_id);
                }
            }
        }
        threads.sort();
        Ok(threads)
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]`
fn encode_thread_id(thread_id: &str) -> String {
    let mut encoded = String::with_capacity(thread_id.len());
    for byte in thread_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn decode_thread_id(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutionState;
    use serde_json::json;
    use tempfile::tempdir;

    fn checkpoint(thread: &str, step: usize) -> Checkpoint {
        let mut state = ExecutionState::from_value(json!({
            "text": "héllo",
            "items": [1, 2.5, {"k": [true, null]}],
        }))
        .unwrap();
        state.step = step;
        Checkpoint::new(thread, state, None)
    }

    #[test]
    fn test_thread_id_encoding() {
        let id = "run-1/review[2]";
        let encoded = encode_thread_id(id);
        assert!(!encoded.contains('/'));
        assert_eq!(decode_thread_id(&encoded).as_deref(), Some(id));
    }

    #[tokio::test]
    async fn test_file_checkpointer_roundtrip() {
        let dir = tempdir().unwrap();
        let checkpointer = FileCheckpointer::new(dir.path(), false);

        let original = checkpoint("t-1", 3);
        checkpointer.save(&original).await.unwrap();

        let loaded = checkpointer.load("t-1").await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(checkpointer.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_checkpointer_compressed_history() {
        let dir = tempdir().unwrap();
        let checkpointer = FileCheckpointer::new(dir.path(), true);

        for step in [4, 1, 9] {
            checkpointer.save(&checkpoint("parent/child", step)).await.unwrap();
        }

        assert_eq!(checkpointer.history("parent/child").await.unwrap(), vec![1, 4, 9]);
        assert_eq!(checkpointer.load("parent/child").await.unwrap().unwrap().step, 9);
        assert_eq!(checkpointer.threads().await.unwrap(), vec!["parent/child"]);

        assert_eq!(checkpointer.prune("parent/child", 1).await.unwrap(), 2);
        assert_eq!(checkpointer.history("parent/child").await.unwrap(), vec![9]);

        checkpointer.delete("parent/child").await.unwrap();
        assert!(checkpointer.load("parent/child").await.unwrap().is_none());
    }
}
