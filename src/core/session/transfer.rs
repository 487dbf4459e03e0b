// src/core/session/transfer.rs

//! Sender side of the chunked transfer sub-protocol.
//!
//! To move a payload larger than one frame without collapsing the link, the
//! sender first negotiates a task-id with a `reason` exchange, then streams
//! `new_f_r` / `update_f_r`* / `end_f_r` triplets, sleeping a configurable
//! interval between chunks so concurrent RPCs can interleave on the same
//! socket. The closing frame carries the content digest; the receiver fails
//! the whole transfer on a mismatch. The first `err` reply aborts the sender.

use crate::core::SentraError;
use crate::core::protocol::{MAX_PAYLOAD, MAX_STRING_SIZE};
use crate::core::session::Session;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Streams a file to the peer. `reason_payload` rides on the opening
/// exchange (a basename hint for sync uploads). Returns the negotiated
/// task-id so the caller can reference the transfer in follow-up commands.
pub async fn send_file(
    session: &Session,
    reason: &str,
    reason_payload: Bytes,
    path: &Path,
    throttle: Duration,
) -> Result<String, SentraError> {
    let task_id = open_transfer(session, reason, reason_payload).await?;
    let base = format!("{task_id} ");
    let chunk_size = MAX_PAYLOAD - base.len();

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut chunk = vec![0u8; chunk_size];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        let mut payload = BytesMut::with_capacity(base.len() + n);
        payload.extend_from_slice(base.as_bytes());
        payload.extend_from_slice(&chunk[..n]);
        session
            .execute("update_f_r", payload.freeze())
            .await?
            .into_result()?;
        tokio::time::sleep(throttle).await;
    }

    close_transfer(session, &task_id, hasher).await?;
    Ok(task_id)
}

/// Streams an in-memory byte string to the peer. Used for large JSON replies
/// (`dapi_res`) where `reason_payload` carries the request id the receiver
/// resolves.
pub async fn send_string(
    session: &Session,
    reason: &str,
    reason_payload: Bytes,
    data: &[u8],
    throttle: Duration,
) -> Result<String, SentraError> {
    if data.len() > MAX_STRING_SIZE {
        return Err(SentraError::Oversize {
            got: data.len(),
            max: MAX_STRING_SIZE,
        });
    }

    let task_id = open_transfer(session, reason, reason_payload).await?;
    let base = format!("{task_id} ");
    let chunk_size = MAX_PAYLOAD - base.len();

    let mut hasher = Md5::new();
    for chunk in data.chunks(chunk_size) {
        hasher.update(chunk);
        let mut payload = BytesMut::with_capacity(base.len() + chunk.len());
        payload.extend_from_slice(base.as_bytes());
        payload.extend_from_slice(chunk);
        session
            .execute("update_f_r", payload.freeze())
            .await?
            .into_result()?;
        tokio::time::sleep(throttle).await;
    }

    close_transfer(session, &task_id, hasher).await?;
    Ok(task_id)
}

/// Negotiates the task-id and opens the destination on the receiver.
async fn open_transfer(
    session: &Session,
    reason: &str,
    reason_payload: Bytes,
) -> Result<String, SentraError> {
    let reply = session.execute(reason, reason_payload).await?;
    let task_id = String::from_utf8(reply.into_result()?.to_vec())?;
    if task_id.is_empty() || task_id.contains(' ') {
        return Err(SentraError::Internal(format!(
            "peer returned an invalid task id '{task_id}'"
        )));
    }
    session
        .execute("new_f_r", Bytes::from(task_id.clone()))
        .await?
        .into_result()?;
    Ok(task_id)
}

/// Sends the closing frame with the content digest.
async fn close_transfer(
    session: &Session,
    task_id: &str,
    hasher: Md5,
) -> Result<(), SentraError> {
    let digest = hex::encode(hasher.finalize());
    session
        .execute_str("end_f_r", &format!("{task_id} {digest}"))
        .await?
        .into_result()?;
    Ok(())
}

/// Computes the hex MD5 digest of a file, streaming it in blocks.
pub async fn file_digest(path: &Path) -> Result<String, SentraError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut block = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut block).await?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
