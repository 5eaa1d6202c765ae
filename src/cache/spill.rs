/// Write-behind persistence for hard-evicted cache entries.
///
/// When an entry falls off the bottom of the tier ladder it is handed to an
/// [`EvictionSink`]. [`SpillWriter`] queues it to a background task that
/// writes one JSON file per key, named by the SHA-256 of the key. The cache
/// never waits on disk: a full queue drops the write with a warning and the
/// eviction proceeds.
///
/// # Example
///
/// ```ignore
/// let spill = SpillWriter::spawn("/var/lib/agent/spill", 256);
/// let cache = TieredCache::new("memory", config, bus).with_sink(spill.clone());
///
/// // later, after the entry was evicted:
/// if let Some(entry) = spill.read("turn-17").await? {
///     println!("spilled at {}", entry.evicted_at);
/// }
/// ```
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{RecallError, RecallResult};
use crate::persistence::write_atomic;

/// An entry that left the cache for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictedEntry {
    pub key: String,
    pub value: JsonValue,
    pub priority: f64,
    pub keywords: Vec<String>,
    pub evicted_at: DateTime<Utc>,
}

/// Receiver of hard evictions and of deletes that must clean up after them.
///
/// Both calls happen under the cache's write lock and must not block.
pub trait EvictionSink: Send + Sync {
    /// Persist an evicted entry.
    fn evicted(&self, entry: EvictedEntry) -> RecallResult<()>;

    /// Drop whatever was persisted for `key`.
    fn removed(&self, key: &str) -> RecallResult<()>;
}

/// File name for a key's artifact: hex SHA-256 plus `.json`.
pub fn artifact_name(key: &str) -> String {
    format!("{}.json", hex::encode(Sha256::digest(key.as_bytes())))
}

enum SpillOp {
    Write(EvictedEntry),
    Remove(String),
    Flush(oneshot::Sender<()>),
}

/// Counters for a spill writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpillStats {
    pub queued: u64,
    pub dropped: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct SpillCounters {
    queued: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Background JSON spill directory.
#[derive(Debug)]
pub struct SpillWriter {
    dir: PathBuf,
    tx: mpsc::Sender<SpillOp>,
    counters: Arc<SpillCounters>,
}

impl SpillWriter {
    /// Start the writer task. Must be called inside a tokio runtime.
    ///
    /// The task ends once the writer is dropped and its queue drained.
    pub fn spawn(dir: impl Into<PathBuf>, queue_depth: usize) -> Arc<Self> {
        let dir = dir.into();
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let counters = Arc::new(SpillCounters::default());
        tokio::spawn(run_writer(dir.clone(), rx, Arc::clone(&counters)));
        Arc::new(Self { dir, tx, counters })
    }

    /// Directory the writer spills into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `key` is (or would be) spilled.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(artifact_name(key))
    }

    /// Wait until everything queued so far has hit the disk.
    pub async fn flush(&self) -> RecallResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(SpillOp::Flush(done_tx))
            .await
            .map_err(|_| RecallError::PersistenceFailure("spill writer stopped".into()))?;
        done_rx
            .await
            .map_err(|_| RecallError::PersistenceFailure("spill writer stopped".into()))
    }

    /// Read a spilled entry back.
    pub async fn read(&self, key: &str) -> RecallResult<Option<EvictedEntry>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RecallError::Io(e)),
        }
    }

    pub fn stats(&self) -> SpillStats {
        SpillStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&self, op: SpillOp) -> RecallResult<()> {
        match self.tx.try_send(op) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(RecallError::PersistenceFailure("spill queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RecallError::PersistenceFailure("spill writer stopped".into()))
            }
        }
    }
}

impl EvictionSink for SpillWriter {
    fn evicted(&self, entry: EvictedEntry) -> RecallResult<()> {
        self.enqueue(SpillOp::Write(entry))
    }

    fn removed(&self, key: &str) -> RecallResult<()> {
        self.enqueue(SpillOp::Remove(key.to_string()))
    }
}

async fn run_writer(dir: PathBuf, mut rx: mpsc::Receiver<SpillOp>, counters: Arc<SpillCounters>) {
    while let Some(op) = rx.recv().await {
        match op {
            SpillOp::Write(entry) => match write_entry(&dir, &entry).await {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %entry.key, "Spilled evicted entry");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %entry.key, error = %e, "Failed to spill evicted entry");
                }
            },
            SpillOp::Remove(key) => match fs::remove_file(dir.join(artifact_name(&key))).await {
                Ok(()) => debug!(key = %key, "Removed spilled entry"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Failed to remove spilled entry");
                }
            },
            SpillOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(dir = %dir.display(), "Spill writer stopped");
}

async fn write_entry(dir: &Path, entry: &EvictedEntry) -> RecallResult<()> {
    write_atomic(&dir.join(artifact_name(&entry.key)), &serde_json::to_vec(entry)?).await
}
