// src/core/session/mod.rs

//! The duplex session multiplexer.
//!
//! One [`Session`] wraps one TCP connection. A single reader task decodes
//! frames in byte order: frames whose counter is present in the
//! pending-response table are responses and wake the caller blocked in
//! [`Session::execute`]; everything else is a request handed to the
//! session's [`RequestDispatcher`] on a spawned task, so the reader never
//! blocks on application logic. Replies travel back on the same counter.

pub mod tasks;
pub mod transfer;

use crate::core::SentraError;
use crate::core::protocol::{Frame, FrameCodec, PayloadCipher};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf, split};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

use tasks::TaskRegistry;

type BoxedRead = ReadHalf<Box<dyn Stream>>;
type BoxedWrite = WriteHalf<Box<dyn Stream>>;

/// Marker trait for anything a session can run over (TCP sockets in
/// production, in-memory duplex pipes in tests).
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

/// A paired response delivered to an [`Session::execute`] caller.
#[derive(Debug, Clone)]
pub struct Reply {
    pub command: String,
    pub payload: Bytes,
}

impl Reply {
    /// Payload as lossy text, for logging and token parsing.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Converts an `err` reply into a [`SentraError::PeerError`], passing any
    /// other command through with its payload.
    pub fn into_result(self) -> Result<Bytes, SentraError> {
        if self.command == "err" {
            Err(SentraError::PeerError(self.text()))
        } else {
            Ok(self.payload)
        }
    }
}

/// Handles requests arriving on a session. One implementation per node role.
#[async_trait::async_trait]
pub trait RequestDispatcher: Send + Sync + 'static {
    /// Processes a request frame. `Ok(Some((command, payload)))` is sent back
    /// on the same counter; `Ok(None)` leaves the exchange unanswered.
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        command: &str,
        payload: Bytes,
    ) -> Result<Option<(String, Bytes)>, SentraError>;

    /// Invoked once, after the reader ends and the session is torn down.
    async fn session_closed(&self, _session: &Arc<Session>) {}
}

/// Counter allocator and pending-response table, guarded together.
struct ExchangeState {
    counter: u32,
    pending: HashMap<u32, oneshot::Sender<Reply>>,
}

/// An active framed connection to a peer node.
pub struct Session {
    tag: String,
    exchange: parking_lot::Mutex<ExchangeState>,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWrite, FrameCodec>>,
    tasks: TaskRegistry,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Wraps `stream` into a session and spawns its reader task. The returned
    /// handle resolves when the reader ends (peer closed or transport error).
    pub fn spawn<S: Stream>(
        stream: S,
        cipher: Option<PayloadCipher>,
        dispatcher: Arc<dyn RequestDispatcher>,
        tag: impl Into<String>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let boxed: Box<dyn Stream> = Box::new(stream);
        let (read_half, write_half) = split(boxed);
        let codec = FrameCodec::new(cipher);
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);
        let (closed_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            tag: tag.into(),
            exchange: parking_lot::Mutex::new(ExchangeState {
                // A random starting counter keeps the two directions of one
                // socket from colliding in each other's pending tables.
                counter: rand::random::<u32>(),
                pending: HashMap::new(),
            }),
            writer: tokio::sync::Mutex::new(writer),
            tasks: TaskRegistry::new(),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        let reader_session = session.clone();
        let handle = tokio::spawn(async move {
            run_reader(reader_session, reader, dispatcher).await;
        });

        (session, handle)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The per-session transfer-task registry.
    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A watch channel that flips to `true` when the session closes.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Serializes one frame onto the socket under the write lock.
    pub async fn send(
        &self,
        counter: u32,
        command: &str,
        payload: Bytes,
    ) -> Result<(), SentraError> {
        if self.is_closed() {
            return Err(SentraError::TransportClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(Frame::new(counter, command, payload)).await
    }

    /// Runs one request/response exchange: allocates a fresh counter,
    /// registers the pending waiter, sends, and blocks on the reply. No lock
    /// is held while waiting.
    pub async fn execute(&self, command: &str, payload: Bytes) -> Result<Reply, SentraError> {
        let (tx, rx) = oneshot::channel();
        let counter = {
            let mut ex = self.exchange.lock();
            let counter = ex.counter;
            ex.counter = ex.counter.wrapping_add(1);
            ex.pending.insert(counter, tx);
            counter
        };

        if let Err(e) = self.send(counter, command, payload).await {
            self.exchange.lock().pending.remove(&counter);
            return Err(e);
        }

        rx.await.map_err(|_| SentraError::TransportClosed)
    }

    /// Convenience wrapper for text payloads.
    pub async fn execute_str(&self, command: &str, payload: &str) -> Result<Reply, SentraError> {
        self.execute(command, Bytes::copy_from_slice(payload.as_bytes()))
            .await
    }

    /// Sends a request on a fresh counter without waiting for a reply.
    /// Used for the unsolicited `hello` a worker fires right after connect.
    pub async fn notify(&self, command: &str, payload: Bytes) -> Result<(), SentraError> {
        let counter = {
            let mut ex = self.exchange.lock();
            let counter = ex.counter;
            ex.counter = ex.counter.wrapping_add(1);
            counter
        };
        self.send(counter, command, payload).await
    }

    /// Closes the session from this side: wakes every waiter, aborts every
    /// transfer, and stops the reader. The write half is shut down so the
    /// peer observes EOF.
    pub async fn close(&self) {
        self.teardown();
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }

    /// Tears the session down: wakes every pending `execute` with
    /// `TransportClosed` and aborts every in-flight transfer task.
    fn teardown(&self) {
        self.closed.store(true, Ordering::Release);
        let pending = {
            let mut ex = self.exchange.lock();
            std::mem::take(&mut ex.pending)
        };
        // Dropping the senders wakes every waiter with a closed-channel error.
        drop(pending);
        self.tasks.abort_all();
        let _ = self.closed_tx.send(true);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tag", &self.tag)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The single reader task. Never blocks on application logic: request
/// handling is spawned, responses are delivered through oneshot channels.
async fn run_reader(
    session: Arc<Session>,
    mut reader: FramedRead<BoxedRead, FrameCodec>,
    dispatcher: Arc<dyn RequestDispatcher>,
) {
    let mut closed = session.closed_watch();
    loop {
        let item = tokio::select! {
            item = reader.next() => item,
            _ = closed.changed() => {
                debug!("[{}] Session closed locally.", session.tag);
                break;
            }
        };
        match item {
            Some(Ok(frame)) => {
                let waiter = session.exchange.lock().pending.remove(&frame.counter);
                if let Some(tx) = waiter {
                    let _ = tx.send(Reply {
                        command: frame.command,
                        payload: frame.payload,
                    });
                } else {
                    spawn_handler(&session, &dispatcher, frame);
                }
            }
            Some(Err(e)) => {
                warn!("[{}] Transport error, closing session: {}", session.tag, e);
                break;
            }
            None => {
                debug!("[{}] Connection closed by peer.", session.tag);
                break;
            }
        }
    }

    session.teardown();
    dispatcher.session_closed(&session).await;
}

fn spawn_handler(session: &Arc<Session>, dispatcher: &Arc<dyn RequestDispatcher>, frame: Frame) {
    let session = session.clone();
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        let counter = frame.counter;
        let command = frame.command;
        let reply = match dispatcher.dispatch(&session, &command, frame.payload).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    "[{}] Error processing command '{}': {}",
                    session.tag, command, e
                );
                Some(("err".to_string(), Bytes::from(e.to_string())))
            }
        };
        if let Some((reply_command, payload)) = reply
            && let Err(e) = session.send(counter, &reply_command, payload).await
        {
            debug!(
                "[{}] Could not send reply for '{}': {}",
                session.tag, command, e
            );
        }
    });
}

/// Fallback request handling shared by both node roles: `echo` and the
/// chunked-transfer verbs. Anything else is an unknown command answered with
/// `err` on the same counter; the session continues.
pub async fn dispatch_common(
    session: &Arc<Session>,
    command: &str,
    payload: Bytes,
) -> Result<Option<(String, Bytes)>, SentraError> {
    match command {
        "echo" => Ok(Some(("ok".to_string(), payload))),
        "new_f_r" | "update_f_r" | "end_f_r" => {
            let ack = session.tasks().route(command, payload).await?;
            Ok(Some(("ack".to_string(), Bytes::from(ack))))
        }
        _ => Err(SentraError::UnknownCommand(command.to_string())),
    }
}
