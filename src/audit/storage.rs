//! Audit storage backends
//!
//! Recorders hand finished batches to an [`AuditStorage`]. Storage errors
//! are reported back to the recorder, which logs them; they never reach the
//! relay.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::record::{Command, ReplayChunk};
use crate::config::StorageConfig;
use crate::error::{ProxyError, Result};

/// Destination for command batches and replay streams.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    async fn upload_commands(&self, commands: &[Command]) -> Result<()>;

    async fn append_replay(&self, session_id: Uuid, chunk: &ReplayChunk) -> Result<()>;

    /// The replay for this session is complete; no more chunks follow.
    async fn finalize_replay(&self, session_id: Uuid) -> Result<()>;
}

/// Pick the storage backend for a configuration.
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn AuditStorage>> {
    match config {
        StorageConfig::Null => Ok(Arc::new(NullStorage)),
        StorageConfig::File { directory } => Ok(Arc::new(FileStorage::new(directory)?)),
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullStorage;

#[async_trait]
impl AuditStorage for NullStorage {
    async fn upload_commands(&self, commands: &[Command]) -> Result<()> {
        debug!("Discarding {} audit commands", commands.len());
        Ok(())
    }

    async fn append_replay(&self, _session_id: Uuid, _chunk: &ReplayChunk) -> Result<()> {
        Ok(())
    }

    async fn finalize_replay(&self, session_id: Uuid) -> Result<()> {
        debug!("Discarding replay for session {}", session_id);
        Ok(())
    }
}

/// JSON Lines files under one directory.
///
/// - `commands.jsonl` - every command of every session
/// - `<session>.replay` - `{"t": <ms>, "data": <base64>}` per chunk
/// - `<session>.done` - written when the replay is finalized
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    // Serializes appends to the shared commands file
    commands_lock: Mutex<()>,
}

#[derive(Serialize)]
struct ReplayLine<'a> {
    t: u64,
    data: &'a str,
}

impl FileStorage {
    pub fn new(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory).map_err(|e| {
            ProxyError::AuditSink(format!(
                "Cannot create audit directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        Ok(Self {
            directory,
            commands_lock: Mutex::new(()),
        })
    }

    pub fn commands_path(&self) -> PathBuf {
        self.directory.join("commands.jsonl")
    }

    pub fn replay_path(&self, session_id: Uuid) -> PathBuf {
        self.directory.join(format!("{}.replay", session_id))
    }

    pub fn done_path(&self, session_id: Uuid) -> PathBuf {
        self.directory.join(format!("{}.done", session_id))
    }

    async fn append(path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| ProxyError::AuditSink(format!("{}: {}", path.display(), e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| ProxyError::AuditSink(format!("{}: {}", path.display(), e)))?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStorage for FileStorage {
    async fn upload_commands(&self, commands: &[Command]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for command in commands {
            serde_json::to_writer(&mut buf, command)?;
            buf.push(b'\n');
        }
        let _guard = self.commands_lock.lock().await;
        Self::append(&self.commands_path(), &buf).await
    }

    async fn append_replay(&self, session_id: Uuid, chunk: &ReplayChunk) -> Result<()> {
        let data = BASE64.encode(&chunk.data);
        let mut line = serde_json::to_vec(&ReplayLine {
            t: chunk.elapsed_ms,
            data: &data,
        })?;
        line.push(b'\n');
        Self::append(&self.replay_path(session_id), &line).await
    }

    async fn finalize_replay(&self, session_id: Uuid) -> Result<()> {
        let stamp = format!("{}\n", chrono::Utc::now().to_rfc3339());
        tokio::fs::write(self.done_path(session_id), stamp)
            .await
            .map_err(|e| ProxyError::AuditSink(e.to_string()))?;
        debug!("Replay for session {} finalized", session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn command(input: &str) -> Command {
        Command {
            session_id: Uuid::nil(),
            org_id: String::new(),
            input: input.into(),
            output: String::new(),
            user: "alice".into(),
            asset: "db".into(),
            system_user: "app".into(),
            timestamp: 1_700_000_000,
            risk_level: 0,
        }
    }

    #[tokio::test]
    async fn test_file_storage_appends_commands() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        storage.upload_commands(&[command("SELECT 1")]).await.unwrap();
        storage
            .upload_commands(&[command("SELECT 2"), command("SELECT 3")])
            .await
            .unwrap();

        let text = std::fs::read_to_string(storage.commands_path()).unwrap();
        let inputs: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["input"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(inputs, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[tokio::test]
    async fn test_file_storage_replay_and_finalize() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let id = Uuid::new_v4();

        storage
            .append_replay(
                id,
                &ReplayChunk {
                    elapsed_ms: 12,
                    data: b"SELECT 1\r\n".to_vec(),
                },
            )
            .await
            .unwrap();
        assert!(!storage.done_path(id).exists());
        storage.finalize_replay(id).await.unwrap();
        assert!(storage.done_path(id).exists());

        let text = std::fs::read_to_string(storage.replay_path(id)).unwrap();
        let line: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(line["t"], 12);
        assert_eq!(
            BASE64.decode(line["data"].as_str().unwrap()).unwrap(),
            b"SELECT 1\r\n"
        );
    }

    #[tokio::test]
    async fn test_file_storage_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let storage = FileStorage::new(&nested).unwrap();
        storage.upload_commands(&[command("x")]).await.unwrap();
        assert!(nested.join("commands.jsonl").exists());
    }

    #[tokio::test]
    async fn test_build_storage() {
        let dir = TempDir::new().unwrap();
        let storage = build_storage(&StorageConfig::File {
            directory: dir.path().to_path_buf(),
        })
        .unwrap();
        storage.upload_commands(&[command("x")]).await.unwrap();
        assert!(dir.path().join("commands.jsonl").exists());

        let null = build_storage(&StorageConfig::Null).unwrap();
        null.upload_commands(&[command("x")]).await.unwrap();
        null.finalize_replay(Uuid::nil()).await.unwrap();
    }
}
