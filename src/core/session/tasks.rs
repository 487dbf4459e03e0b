// src/core/session/tasks.rs

//! The per-session transfer-task registry and the receiver-side state
//! machines of the chunked sub-protocol.
//!
//! Every incoming transfer is owned by one receiver task. The dispatcher
//! routes `new_f_r` / `update_f_r` / `end_f_r` frames to the receiver through
//! a bounded queue keyed by the task-id; the receiver walks
//! Idle → Open → Updating → Closed, watches for idle timeouts, and verifies
//! the announced digest before handing the destination to its consumer.

use crate::core::SentraError;
use crate::core::protocol::MAX_STRING_SIZE;
use bytes::Bytes;
use dashmap::DashMap;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

/// One step of an incoming chunked transfer.
#[derive(Debug)]
pub enum ChunkEvent {
    /// `new_f_r`: open the destination.
    Open,
    /// `update_f_r`: append one chunk.
    Update(Bytes),
    /// `end_f_r`: close and verify against the announced hex digest.
    Close(String),
}

/// Per-session map of in-flight receiver tasks, keyed by task-id.
///
/// Task-ids have the form `"<command>-<seq>[-<basename>]"` and are unique
/// within the session. Entries are removed when the receiver completes or
/// errors; tearing the registry down drops every queue, which ends the
/// receivers with a transport error.
pub struct TaskRegistry {
    seq: AtomicU64,
    tasks: DashMap<String, mpsc::Sender<ChunkEvent>>,
}

/// Queue depth between the dispatcher and one receiver task. Bounded so a
/// slow disk backpressures the sender through the `update_f_r` replies.
const CHUNK_QUEUE_DEPTH: usize = 64;

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            tasks: DashMap::new(),
        }
    }

    /// Registers a new receiver under a fresh task-id and returns the id
    /// together with the queue end the receiver consumes.
    pub fn register(
        &self,
        command: &str,
        basename: Option<&str>,
    ) -> (String, mpsc::Receiver<ChunkEvent>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let task_id = match basename {
            Some(name) => format!("{command}-{seq}-{name}"),
            None => format!("{command}-{seq}"),
        };
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        self.tasks.insert(task_id.clone(), tx);
        (task_id, rx)
    }

    /// Removes a completed or failed receiver.
    pub fn remove(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Routes one chunk frame to its receiver. The first whitespace-delimited
    /// token of `data` is the task-id; the remainder is the chunk payload.
    pub async fn route(&self, command: &str, data: Bytes) -> Result<String, SentraError> {
        let split_at = data.iter().position(|&b| b == b' ').unwrap_or(data.len());
        let task_id = std::str::from_utf8(&data[..split_at])?.to_string();
        let rest = if split_at < data.len() {
            data.slice(split_at + 1..)
        } else {
            Bytes::new()
        };

        let event = match command {
            "new_f_r" => ChunkEvent::Open,
            "update_f_r" => ChunkEvent::Update(rest),
            "end_f_r" => ChunkEvent::Close(std::str::from_utf8(&rest)?.trim().to_string()),
            other => return Err(SentraError::UnknownCommand(other.to_string())),
        };

        let sender = self
            .tasks
            .get(&task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SentraError::TaskNotFound(task_id.clone()))?;
        sender
            .send(event)
            .await
            .map_err(|_| SentraError::TaskNotFound(task_id.clone()))?;

        Ok(format!("Chunk received for {task_id}"))
    }

    /// Drops every queue. Receivers observe the closed channel and fail with
    /// `TransportClosed`, deleting their temp destinations.
    pub fn abort_all(&self) {
        self.tasks.clear();
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives one chunked file into `dest`, verifying the digest announced in
/// the closing frame. On any failure the partially written file is deleted
/// and the error propagated; the transfer is not resumable.
pub async fn receive_file(
    mut rx: mpsc::Receiver<ChunkEvent>,
    dest: PathBuf,
    max_idle: Duration,
) -> Result<PathBuf, SentraError> {
    let result = receive_file_inner(&mut rx, &dest, max_idle).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&dest).await;
    }
    result.map(|()| dest)
}

async fn receive_file_inner(
    rx: &mut mpsc::Receiver<ChunkEvent>,
    dest: &Path,
    max_idle: Duration,
) -> Result<(), SentraError> {
    let mut file: Option<tokio::fs::File> = None;
    let mut hasher = Md5::new();
    let mut received: u64 = 0;

    loop {
        match next_event(rx, max_idle).await? {
            ChunkEvent::Open => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                debug!("Opening reception file {}", dest.display());
                file = Some(tokio::fs::File::create(dest).await?);
            }
            ChunkEvent::Update(chunk) => {
                let f = file
                    .as_mut()
                    .ok_or_else(|| SentraError::Internal("chunk received before open".into()))?;
                f.write_all(&chunk).await?;
                hasher.update(&chunk);
                received += chunk.len() as u64;
            }
            ChunkEvent::Close(expected) => {
                let f = file
                    .take()
                    .ok_or_else(|| SentraError::Internal("close received before open".into()))?;
                f.sync_all().await?;
                drop(f);
                let found = hex::encode(hasher.finalize());
                if found != expected {
                    return Err(SentraError::ChecksumMismatch { expected, found });
                }
                debug!("Reception completed: {} bytes into {}", received, dest.display());
                return Ok(());
            }
        }
    }
}

/// Receives one chunked string into memory, verifying the closing digest.
pub async fn receive_string(
    mut rx: mpsc::Receiver<ChunkEvent>,
    max_idle: Duration,
) -> Result<Vec<u8>, SentraError> {
    let mut buf: Option<Vec<u8>> = None;
    let mut hasher = Md5::new();

    loop {
        match next_event(&mut rx, max_idle).await? {
            ChunkEvent::Open => {
                buf = Some(Vec::new());
            }
            ChunkEvent::Update(chunk) => {
                let b = buf
                    .as_mut()
                    .ok_or_else(|| SentraError::Internal("chunk received before open".into()))?;
                if b.len() + chunk.len() > MAX_STRING_SIZE {
                    return Err(SentraError::Oversize {
                        got: b.len() + chunk.len(),
                        max: MAX_STRING_SIZE,
                    });
                }
                b.extend_from_slice(&chunk);
                hasher.update(&chunk);
            }
            ChunkEvent::Close(expected) => {
                let b = buf
                    .take()
                    .ok_or_else(|| SentraError::Internal("close received before open".into()))?;
                let found = hex::encode(hasher.finalize());
                if found != expected {
                    return Err(SentraError::ChecksumMismatch { expected, found });
                }
                return Ok(b);
            }
        }
    }
}

/// Pulls the next chunk from the queue, failing the transfer when the
/// watchdog expires or the session tears the queue down.
async fn next_event(
    rx: &mut mpsc::Receiver<ChunkEvent>,
    max_idle: Duration,
) -> Result<ChunkEvent, SentraError> {
    match timeout(max_idle, rx.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(SentraError::TransportClosed),
        Err(_) => Err(SentraError::TransferTimeout(max_idle)),
    }
}
