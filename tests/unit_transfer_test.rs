use bytes::Bytes;
use sentra::core::SentraError;
use sentra::core::session::tasks::{self, ChunkEvent};
use sentra::core::session::{RequestDispatcher, Session, dispatch_common, transfer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const MAX_IDLE: Duration = Duration::from_secs(5);

/// Receiver-side dispatcher: the `upload` reason opens a file reception into
/// the given directory and reports the outcome on a channel.
struct UploadDispatcher {
    dir: PathBuf,
    done_tx: mpsc::Sender<Result<PathBuf, SentraError>>,
}

#[async_trait::async_trait]
impl RequestDispatcher for UploadDispatcher {
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        command: &str,
        payload: Bytes,
    ) -> Result<Option<(String, Bytes)>, SentraError> {
        match command {
            "upload" => {
                let hint = String::from_utf8_lossy(&payload).into_owned();
                let (task_id, rx) = session.tasks().register(command, Some(&hint));
                let dest = self.dir.join(format!("{task_id}.tmp"));
                let done_tx = self.done_tx.clone();
                let registry_session = session.clone();
                let registry_task_id = task_id.clone();
                tokio::spawn(async move {
                    let result = tasks::receive_file(rx, dest, MAX_IDLE).await;
                    registry_session.tasks().remove(&registry_task_id);
                    let _ = done_tx.send(result).await;
                });
                Ok(Some(("ok".to_string(), Bytes::from(task_id))))
            }
            _ => dispatch_common(session, command, payload).await,
        }
    }
}

struct PlainDispatcher;

#[async_trait::async_trait]
impl RequestDispatcher for PlainDispatcher {
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        command: &str,
        payload: Bytes,
    ) -> Result<Option<(String, Bytes)>, SentraError> {
        dispatch_common(session, command, payload).await
    }
}

#[tokio::test]
async fn test_chunked_file_transfer_materializes_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let (done_tx, mut done_rx) = mpsc::channel(1);

    let (a, b) = tokio::io::duplex(1 << 20);
    let (sender, _) = Session::spawn(a, None, Arc::new(PlainDispatcher), "sender");
    let (_receiver, _) = Session::spawn(
        b,
        None,
        Arc::new(UploadDispatcher {
            dir: dir.path().to_path_buf(),
            done_tx,
        }),
        "receiver",
    );

    // A multi-chunk pseudo-random blob (deterministic, several frame loads).
    let blob: Vec<u8> = (0..5_000_000u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
        .collect();
    let source = dir.path().join("source.bin");
    std::fs::write(&source, &blob).unwrap();

    let task_id = transfer::send_file(
        &sender,
        "upload",
        Bytes::from_static(b"source.bin"),
        &source,
        Duration::ZERO,
    )
    .await
    .unwrap();
    assert!(task_id.starts_with("upload-"));
    assert!(task_id.ends_with("source.bin"));

    let received = done_rx.recv().await.unwrap().unwrap();
    let materialized = std::fs::read(&received).unwrap();
    assert_eq!(materialized, blob);
}

#[tokio::test]
async fn test_chunked_string_transfer_round_trip() {
    let (a, b) = tokio::io::duplex(1 << 20);
    let (sender, _) = Session::spawn(a, None, Arc::new(PlainDispatcher), "sender");

    let (done_tx, mut done_rx) = mpsc::channel::<Result<Vec<u8>, SentraError>>(1);
    struct StringDispatcher {
        done_tx: mpsc::Sender<Result<Vec<u8>, SentraError>>,
    }
    #[async_trait::async_trait]
    impl RequestDispatcher for StringDispatcher {
        async fn dispatch(
            &self,
            session: &Arc<Session>,
            command: &str,
            payload: Bytes,
        ) -> Result<Option<(String, Bytes)>, SentraError> {
            match command {
                "blob" => {
                    let (task_id, rx) = session.tasks().register(command, None);
                    let done_tx = self.done_tx.clone();
                    let registry_session = session.clone();
                    let registry_task_id = task_id.clone();
                    tokio::spawn(async move {
                        let result = tasks::receive_string(rx, MAX_IDLE).await;
                        registry_session.tasks().remove(&registry_task_id);
                        let _ = done_tx.send(result).await;
                    });
                    Ok(Some(("ok".to_string(), Bytes::from(task_id))))
                }
                _ => dispatch_common(session, command, payload).await,
            }
        }
    }
    let (_receiver, _) = Session::spawn(b, None, Arc::new(StringDispatcher { done_tx }), "receiver");

    let data: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
    transfer::send_string(&sender, "blob", Bytes::new(), &data, Duration::ZERO)
        .await
        .unwrap();
    let received = done_rx.recv().await.unwrap().unwrap();
    assert_eq!(received, data);
}

#[tokio::test]
async fn test_corrupted_chunk_fails_digest_and_deletes_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("reception.tmp");
    let (tx, rx) = mpsc::channel(8);

    let dest_clone = dest.clone();
    let receiver = tokio::spawn(async move { tasks::receive_file(rx, dest_clone, MAX_IDLE).await });

    tx.send(ChunkEvent::Open).await.unwrap();
    tx.send(ChunkEvent::Update(Bytes::from_static(b"tampered content")))
        .await
        .unwrap();
    // Digest of the original, un-tampered content.
    let original_digest = hex::encode(<md5::Md5 as md5::Digest>::digest(b"original content"));
    tx.send(ChunkEvent::Close(original_digest)).await.unwrap();

    let err = receiver.await.unwrap().unwrap_err();
    assert!(matches!(err, SentraError::ChecksumMismatch { .. }));
    assert!(!dest.exists(), "temp file must be deleted on failure");
}

#[tokio::test]
async fn test_receiver_watchdog_expires_without_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("reception.tmp");
    let (tx, rx) = mpsc::channel(8);

    tx.send(ChunkEvent::Open).await.unwrap();
    let err = tasks::receive_file(rx, dest.clone(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, SentraError::TransferTimeout(_)));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_chunk_for_unknown_task_is_rejected() {
    let (a, b) = tokio::io::duplex(1 << 16);
    let (sender, _) = Session::spawn(a, None, Arc::new(PlainDispatcher), "sender");
    let (_receiver, _) = Session::spawn(b, None, Arc::new(PlainDispatcher), "receiver");

    let reply = sender
        .execute("update_f_r", Bytes::from_static(b"missing-task chunkdata"))
        .await
        .unwrap();
    assert_eq!(reply.command, "err");
    assert!(reply.text().contains("missing-task"));
}
