//! Job Queues
//!
//! [`JobQueue`] implementations: an in-process FIFO and a directory-backed
//! FIFO that survives restarts. Payloads are opaque bytes.

use crate::domain::ports::JobQueue;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

// =============================================================================
// Memory Queue
// =============================================================================

/// In-process FIFO per key
#[derive(Default)]
pub struct MemoryQueue {
    lists: DashMap<String, VecDeque<Vec<u8>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.lists.entry(key.to_string()).or_default().push_back(payload);
        Ok(())
    }

    async fn pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lists.get_mut(key).and_then(|mut list| list.pop_front()))
    }

    async fn len(&self, key: &str) -> Result<usize> {
        Ok(self.lists.get(key).map(|list| list.len()).unwrap_or(0))
    }
}

// =============================================================================
// File Queue
// =============================================================================

const JOB_EXT: &str = "job";

/// One directory per key, one file per job named by a zero padded
/// sequence number so lexical order is FIFO order.
///
/// A pop claims its file with a rename before reading it, so concurrent
/// consumers of the same directory never hand out a job twice.
pub struct FileQueue {
    root: PathBuf,
    seq: AtomicU64,
}

impl FileQueue {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let mut next = 0;
        let mut keys = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = keys.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            for (seq, _) in Self::pending(&entry.path()).await? {
                next = next.max(seq + 1);
            }
        }

        debug!("Opened file queue at {} (next seq {})", root.display(), next);
        Ok(Self {
            root,
            seq: AtomicU64::new(next),
        })
    }

    fn key_dir(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(Error::Queue(format!("invalid queue key: {:?}", key)));
        }
        Ok(self.root.join(key))
    }

    /// Queued jobs of a key directory, oldest first
    async fn pending(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut jobs = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(jobs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOB_EXT) {
                continue;
            }
            if let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                jobs.push((seq, path));
            }
        }
        jobs.sort_by_key(|(seq, _)| *seq);
        Ok(jobs)
    }
}

#[async_trait]
impl JobQueue for FileQueue {
    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let dir = self.key_dir(key)?;
        tokio::fs::create_dir_all(&dir).await?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let tmp = dir.join(format!(".{:020}.tmp", seq));
        let path = dir.join(format!("{:020}.{}", seq, JOB_EXT));
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let dir = self.key_dir(key)?;
        for (_, path) in Self::pending(&dir).await? {
            let claimed = dir.join(format!(".claimed-{}", uuid::Uuid::new_v4()));
            match tokio::fs::rename(&path, &claimed).await {
                Ok(()) => {}
                // another consumer got there first
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            let payload = tokio::fs::read(&claimed).await?;
            if let Err(e) = tokio::fs::remove_file(&claimed).await {
                warn!("Could not remove claimed job {}: {}", claimed.display(), e);
            }
            return Ok(Some(payload));
        }
        Ok(None)
    }

    async fn len(&self, key: &str) -> Result<usize> {
        Ok(Self::pending(&self.key_dir(key)?).await?.len())
    }
}
