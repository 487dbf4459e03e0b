// src/core/control/mod.rs

//! The local control socket: a UNIX stream listener co-located processes
//! (the API layer) use to inject requests into the dispatcher.
//!
//! The protocol is line-delimited text: `<command> <json>` per request, one
//! JSON envelope `{"data"|"message", "error"}` per reply. Commands: `dapi`,
//! `dapi_forward <node>`, `get_nodes`, `get_health`.

use crate::core::SentraError;
use crate::core::dispatch::{ApiRequest, envelope_err, envelope_ok};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What the control socket can do on this node. One implementation per role:
/// the master answers registry queries locally, a worker asks its master.
#[async_trait::async_trait]
pub trait ControlBackend: Send + Sync + 'static {
    /// Routes a distributed request and returns the response envelope.
    async fn dapi(&self, request: ApiRequest) -> Value;
    /// Routes a request pinned to a named node.
    async fn dapi_forward(&self, node: &str, request: ApiRequest) -> Value;
    /// The registry view of connected nodes.
    async fn get_nodes(&self, args: Value) -> Result<Value, SentraError>;
    /// Per-worker sync health.
    async fn get_health(&self, filter: Value) -> Result<Value, SentraError>;
}

/// Binds the control socket and serves connections until shutdown. A stale
/// socket file from a previous run is removed before binding.
pub async fn run(
    path: PathBuf,
    backend: Arc<dyn ControlBackend>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), SentraError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if path.exists() {
        tokio::fs::remove_file(&path).await?;
    }
    let listener = UnixListener::bind(&path)?;
    info!("Control socket listening on {}", path.display());

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Control socket shutting down.");
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let backend = backend.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, backend).await {
                                debug!("Control connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Control socket accept failed: {}", e),
                }
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    backend: Arc<dyn ControlBackend>,
) -> Result<(), SentraError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(line, backend.as_ref()).await;
        let mut out = response.to_string();
        out.push('\n');
        write_half.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn handle_line(line: &str, backend: &dyn ControlBackend) -> Value {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));

    match command {
        "dapi" => match parse_request(rest) {
            Ok(request) => backend.dapi(request).await,
            Err(e) => envelope_err(e.code(), e.to_string()),
        },
        "dapi_forward" => {
            let Some((node, json)) = rest.split_once(' ') else {
                return envelope_err(1000, "dapi_forward needs a node name and a request");
            };
            match parse_request(json) {
                Ok(request) => backend.dapi_forward(node, request).await,
                Err(e) => envelope_err(e.code(), e.to_string()),
            }
        }
        "get_nodes" => wrap(backend.get_nodes(parse_args(rest)).await),
        "get_health" => wrap(backend.get_health(parse_args(rest)).await),
        other => envelope_err(
            SentraError::UnknownCommand(other.into()).code(),
            format!("Unknown command received '{other}'"),
        ),
    }
}

fn wrap(result: Result<Value, SentraError>) -> Value {
    match result {
        Ok(data) => envelope_ok(data),
        Err(e) => envelope_err(e.code(), e.to_string()),
    }
}

fn parse_request(json: &str) -> Result<ApiRequest, SentraError> {
    serde_json::from_str(json).map_err(SentraError::from)
}

fn parse_args(json: &str) -> Value {
    if json.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(json).unwrap_or(Value::Null)
    }
}

/// Connects to a control socket and runs one request line, for co-located
/// tooling and tests.
pub async fn execute(path: &Path, line: &str) -> Result<Value, SentraError> {
    let stream = UnixStream::connect(path).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    let mut lines = BufReader::new(read_half).lines();
    match lines.next_line().await? {
        Some(reply) => Ok(serde_json::from_str(&reply)?),
        None => Err(SentraError::TransportClosed),
    }
}
