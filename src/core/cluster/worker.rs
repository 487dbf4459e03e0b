// src/core/cluster/worker.rs

//! The worker runtime.
//!
//! A worker owns the connection to its master: it connects, sends the
//! unsolicited `hello`, and runs the three periodic synchronization loops
//! plus a keep-alive tick for as long as the session lives. Lost connections
//! are retried with exponential backoff and jitter.

use crate::config::Config;
use crate::core::SentraError;
use crate::core::cluster::NodeType;
use crate::core::dispatch::router::{
    ClusterLink, DapiWaiters, Router, forward_over_session, setup_dapi_res_receiver,
    spawn_dapi_execution, split_request_id,
};
use crate::core::dispatch::{AgentDirectory, ApiRequest, FunctionRegistry};
use crate::core::protocol::PayloadCipher;
use crate::core::session::{RequestDispatcher, Session, dispatch_common, tasks, transfer};
use crate::core::sync::apply::AgentRemovalHook;
use crate::core::sync::bundle::{IntegrityReply, SyncBundle};
use crate::core::sync::{ClusterItems, SourceKind, apply, bundle, scanner};
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rand::Rng;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// The initial delay before the first reconnection attempt.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
// The maximum delay for the exponential backoff reconnection strategy.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Shared worker-side state.
pub struct WorkerState {
    pub config: Arc<Config>,
    pub identity: crate::core::cluster::NodeIdentity,
    pub manifest: Arc<ClusterItems>,
    pub registry: Arc<FunctionRegistry>,
    pub directory: Arc<dyn AgentDirectory>,
    pub waiters: Arc<DapiWaiters>,
    pub agent_removal_hook: Option<AgentRemovalHook>,
    session: parking_lot::Mutex<Option<Arc<Session>>>,
    connected: AtomicBool,
    router: OnceCell<Arc<Router>>,
}

impl WorkerState {
    pub fn new(
        config: Arc<Config>,
        manifest: Arc<ClusterItems>,
        registry: Arc<FunctionRegistry>,
        directory: Arc<dyn AgentDirectory>,
        agent_removal_hook: Option<AgentRemovalHook>,
    ) -> Arc<Self> {
        let identity = config.identity();
        let state = Arc::new(Self {
            config,
            identity,
            manifest,
            registry: registry.clone(),
            directory: directory.clone(),
            waiters: Arc::new(DapiWaiters::new()),
            agent_removal_hook,
            session: parking_lot::Mutex::new(None),
            connected: AtomicBool::new(false),
            router: OnceCell::new(),
        });
        let link = Arc::new(WorkerLink {
            state: Arc::downgrade(&state),
        });
        let router = Arc::new(Router::new(registry, directory, link));
        state
            .router
            .set(router)
            .unwrap_or_else(|_| unreachable!("router set once"));
        state
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.get().expect("router set at construction").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The live master session, when connected.
    pub fn master_session(&self) -> Result<Arc<Session>, SentraError> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| SentraError::NodeNotConnected("master".into()))
    }

    fn set_session(&self, session: Arc<Session>) {
        *self.session.lock() = Some(session);
        self.connected.store(true, Ordering::Release);
    }

    fn clear_session(&self) {
        *self.session.lock() = None;
        self.connected.store(false, Ordering::Release);
    }
}

/// The worker's view of the cluster: everything goes through the master.
struct WorkerLink {
    state: Weak<WorkerState>,
}

#[async_trait::async_trait]
impl ClusterLink for WorkerLink {
    fn node_name(&self) -> String {
        self.state
            .upgrade()
            .map(|s| s.identity.node_name.clone())
            .unwrap_or_default()
    }

    fn node_type(&self) -> NodeType {
        NodeType::Worker
    }

    fn master_name(&self) -> String {
        // Workers never resolve solver maps; the master substitutes its own
        // name once the request reaches it.
        String::new()
    }

    async fn forward(
        &self,
        node: Option<&str>,
        request: &ApiRequest,
    ) -> Result<Value, SentraError> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| SentraError::Internal("worker state dropped".into()))?;
        let session = state.master_session()?;
        let deadline = (!request.wait_for_complete).then(|| state.config.request_timeout);
        forward_over_session(&session, &state.waiters, node, request, deadline).await
    }
}

/// The connect-and-retry loop. Returns only on shutdown.
pub async fn run(
    state: Arc<WorkerState>,
    cipher: Option<PayloadCipher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), SentraError> {
    let master_addr = format!(
        "{}:{}",
        state
            .config
            .nodes
            .first()
            .ok_or_else(|| SentraError::InvalidConfig("no master address configured".into()))?,
        state.config.port
    );
    let mut current_delay = INITIAL_RECONNECT_DELAY;

    loop {
        info!("Attempting to connect to master at {}", master_addr);
        let connected = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Worker shutting down.");
                return Ok(());
            }
            result = TcpStream::connect(&master_addr) => result,
        };

        match connected {
            Ok(stream) => {
                current_delay = INITIAL_RECONNECT_DELAY;
                handle_connection(&state, cipher.clone(), stream, &mut shutdown_rx).await;
                info!("Connection to master closed. Reconnecting...");
            }
            Err(e) => {
                warn!("Could not connect to master: {}. Retrying...", e);
            }
        }

        // Exponential backoff with jitter to avoid thundering herd on master
        // restart.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        let wait_time = current_delay + jitter;
        info!("Will try to reconnect to master in {wait_time:?}");
        tokio::select! {
            _ = tokio::time::sleep(wait_time) => {}
            _ = shutdown_rx.recv() => {
                info!("Worker shutting down during backoff.");
                return Ok(());
            }
        }
        current_delay = (current_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

/// Runs one connection lifecycle: hello, sync loops, keep-alive, teardown.
async fn handle_connection(
    state: &Arc<WorkerState>,
    cipher: Option<PayloadCipher>,
    stream: TcpStream,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let handler = Arc::new(WorkerSessionHandler {
        state: state.clone(),
        uploads: DashMap::new(),
    });
    let (session, reader) = Session::spawn(stream, cipher, handler, "Master");

    let hello = state.identity.hello_payload();
    if let Err(e) = session.notify("hello", Bytes::from(hello)).await {
        error!("Could not send hello: {}", e);
        session.close().await;
        return;
    }
    state.set_session(session.clone());
    info!("Connected to master.");

    let mut loops = JoinSet::new();
    loops.spawn(sync_integrity_loop(state.clone(), session.clone()));
    loops.spawn(sync_agent_info_loop(state.clone(), session.clone()));
    loops.spawn(keep_alive_loop(state.clone(), session.clone()));

    tokio::select! {
        _ = reader => {}
        _ = shutdown_rx.recv() => {
            info!("Worker shutting down; closing master session.");
            session.close().await;
        }
    }

    loops.abort_all();
    state.clear_session();
}

// --- Periodic synchronization loops ---

async fn sync_integrity_loop(state: Arc<WorkerState>, session: Arc<Session>) {
    loop {
        let before = Instant::now();
        match sync_cycle(&state, &session, SyncKind::Integrity).await {
            Ok(true) => debug!(
                "Time synchronizing integrity: {:.3} s",
                before.elapsed().as_secs_f64()
            ),
            Ok(false) => {}
            Err(e) => error!("Integrity synchronization failed: {}", e),
        }
        tokio::time::sleep(state.config.interval.sync_integrity).await;
        if session.is_closed() {
            return;
        }
    }
}

async fn sync_agent_info_loop(state: Arc<WorkerState>, session: Arc<Session>) {
    loop {
        let before = Instant::now();
        match sync_cycle(&state, &session, SyncKind::AgentInfo).await {
            Ok(true) => debug!(
                "Time synchronizing agent statuses: {:.3} s",
                before.elapsed().as_secs_f64()
            ),
            Ok(false) => {}
            Err(e) => error!("Agent status synchronization failed: {}", e),
        }
        tokio::time::sleep(state.config.interval.sync_files).await;
        if session.is_closed() {
            return;
        }
    }
}

async fn keep_alive_loop(state: Arc<WorkerState>, session: Arc<Session>) {
    loop {
        tokio::time::sleep(state.config.interval.keep_alive).await;
        match session.execute(
            "echo",
            Bytes::from_static(b"keepalive"),
        )
        .await
        {
            Ok(_) => debug!("Keep-alive acknowledged."),
            Err(e) => {
                warn!("Keep-alive failed: {}", e);
                return;
            }
        }
    }
}

/// The three upload shapes a worker produces.
#[derive(Clone)]
enum SyncKind {
    Integrity,
    AgentInfo,
    /// Group files the master asked for in its last integrity reply.
    ExtraValid(Vec<String>),
}

impl SyncKind {
    fn command(&self) -> &'static str {
        match self {
            SyncKind::Integrity => "sync_i_w_m",
            SyncKind::AgentInfo => "sync_a_w_m",
            SyncKind::ExtraValid(_) => "sync_e_w_m",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SyncKind::Integrity => "integrity",
            SyncKind::AgentInfo => "agent-info",
            SyncKind::ExtraValid(_) => "extra-valid",
        }
    }
}

/// One full worker→master cycle: permission, bundle, chunked upload, end
/// signal. Returns `Ok(false)` when the master denied permission. A failure
/// after the grant tells the master to drop the cycle so the gate reopens.
async fn sync_cycle(
    state: &Arc<WorkerState>,
    session: &Arc<Session>,
    kind: SyncKind,
) -> Result<bool, SentraError> {
    let command = kind.command();
    let permission = session
        .execute_str(&format!("{command}_p"), "")
        .await?
        .into_result()?;
    if permission.as_ref() != b"true" {
        info!(
            "Master did not grant permission to synchronize {}.",
            kind.label()
        );
        return Ok(false);
    }
    debug!("Permission to synchronize {} granted.", kind.label());

    let result = upload_bundle(state, session, &kind).await;
    if let Err(e) = result {
        // Tell the master the cycle is dead so it restores the gate.
        let _ = session.execute_str(&format!("{command}_e"), "abort").await;
        return Err(e);
    }
    Ok(true)
}

async fn upload_bundle(
    state: &Arc<WorkerState>,
    session: &Arc<Session>,
    kind: &SyncKind,
) -> Result<(), SentraError> {
    let root = state.config.data_dir.clone();
    let manifest = state.manifest.clone();
    let node_name = state.identity.node_name.clone();
    let command = kind.command();
    let label = kind.label();
    let blocking_kind = kind.clone();

    let staged = tokio::task::spawn_blocking(move || {
        let upload = match blocking_kind {
            SyncKind::Integrity => {
                // Metadata only; the master diffs digests.
                let index = scanner::scan_files(
                    &root,
                    &manifest,
                    SourceKind::Master,
                    NodeType::Worker,
                    true,
                )?;
                SyncBundle {
                    node_name: node_name.clone(),
                    index,
                    files: Default::default(),
                }
            }
            SyncKind::AgentInfo => {
                let index = scanner::scan_files(
                    &root,
                    &manifest,
                    SourceKind::Worker,
                    NodeType::Worker,
                    false,
                )?;
                let files = bundle::read_bodies(&root, &index);
                SyncBundle {
                    node_name: node_name.clone(),
                    index,
                    files,
                }
            }
            SyncKind::ExtraValid(group_files) => {
                build_extra_valid_bundle(&root, &manifest, &node_name, &group_files)?
            }
        };
        let compressed = bundle::compress(&upload)?;
        bundle::stage(&root, &node_name, label, &compressed)
    })
    .await
    .map_err(|e| SentraError::Internal(format!("bundle build task failed: {e}")))??;

    debug!("Sending {} bundle to master.", label);
    let task_id = transfer::send_file(
        session,
        command,
        Bytes::from(format!("{label}.bundle")),
        &staged,
        state.config.interval.file_transfer_send,
    )
    .await?;
    session
        .execute_str(&format!("{command}_e"), &format!("{task_id} {label}.bundle"))
        .await?
        .into_result()?;
    let _ = tokio::fs::remove_file(&staged).await;
    Ok(())
}

/// Merges the requested group files into one container and wraps it in a
/// bundle the master can unmerge.
fn build_extra_valid_bundle(
    root: &std::path::Path,
    manifest: &ClusterItems,
    node_name: &str,
    group_files: &[String],
) -> Result<SyncBundle, SentraError> {
    let (count, merged_rel) = bundle::merge_group_files(root, node_name, group_files)?;
    if count == 0 {
        return Ok(SyncBundle {
            node_name: node_name.to_string(),
            ..Default::default()
        });
    }

    let merged_path = root.join(merged_rel.trim_start_matches('/'));
    let content = std::fs::read(&merged_path)?;
    let group_key = "/queue/agent-groups/";
    let (umask, write_mode) = manifest
        .files
        .get(group_key)
        .map(|spec| (spec.umask, spec.write_mode))
        .unwrap_or((0o117, crate::core::sync::WriteMode::Atomic));

    let meta = scanner::FileMeta {
        digest: hex::encode(<md5::Md5 as md5::Digest>::digest(&content)),
        mtime: scanner::unix_now(),
        size: content.len() as u64,
        umask,
        write_mode,
        merged: true,
        merge_type: Some("agent-groups".to_string()),
        cluster_item_key: group_key.to_string(),
    };

    let mut upload = SyncBundle {
        node_name: node_name.to_string(),
        ..Default::default()
    };
    upload.index.insert(merged_rel.clone(), meta);
    upload.files.insert(merged_rel, content);
    let _ = std::fs::remove_file(&merged_path);
    Ok(upload)
}

// --- Handling of the master's integrity reply ---

/// Per-connection request handler on the worker side.
pub struct WorkerSessionHandler {
    state: Arc<WorkerState>,
    /// Receptions opened by `sync_m_c`, completed by `sync_m_c_e`.
    uploads: DashMap<String, oneshot::Receiver<Result<PathBuf, SentraError>>>,
}

#[async_trait::async_trait]
impl RequestDispatcher for WorkerSessionHandler {
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        command: &str,
        payload: Bytes,
    ) -> Result<Option<(String, Bytes)>, SentraError> {
        match command {
            "sync_m_c" => {
                let (task_id, chunk_rx) = session.tasks().register(command, None);
                let dest = self
                    .state
                    .config
                    .data_dir
                    .join("queue/cluster/master")
                    .join(format!("{task_id}.tmp"));
                let (done_tx, done_rx) = oneshot::channel();
                let max_idle = self.state.config.max_time_receiving_file;
                let registry_session = session.clone();
                let registry_task_id = task_id.clone();
                tokio::spawn(async move {
                    let result = tasks::receive_file(chunk_rx, dest, max_idle).await;
                    registry_session.tasks().remove(&registry_task_id);
                    let _ = done_tx.send(result);
                });
                self.uploads.insert(task_id.clone(), done_rx);
                Ok(Some(("ok".to_string(), Bytes::from(task_id))))
            }
            "sync_m_c_e" => {
                let text = std::str::from_utf8(&payload)?;
                let task_id = text.split(' ').next().unwrap_or_default().to_string();
                let (_, done_rx) = self
                    .uploads
                    .remove(&task_id)
                    .ok_or_else(|| SentraError::TaskNotFound(task_id.clone()))?;
                let path = match done_rx.await {
                    Ok(result) => result?,
                    Err(_) => return Err(SentraError::TransportClosed),
                };
                let state = self.state.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(e) = process_master_reply(&state, &session, &path).await {
                        error!("Error applying master integrity reply: {}", e);
                    }
                    let _ = tokio::fs::remove_file(&path).await;
                });
                Ok(Some((
                    "ok".to_string(),
                    Bytes::from_static(b"File correctly received"),
                )))
            }
            "sync_m_c_ok" => Ok(Some(("ok".to_string(), Bytes::from_static(b"Thanks")))),
            "dapi" => {
                let (request_id, request_json) = split_request_id(&payload)?;
                spawn_dapi_execution(
                    self.state.router(),
                    session.clone(),
                    request_id,
                    request_json,
                    self.state.config.interval.string_transfer_send,
                );
                Ok(Some((
                    "ok".to_string(),
                    Bytes::from_static(b"Added request to API requests queue"),
                )))
            }
            "dapi_res" => {
                let request_id = std::str::from_utf8(&payload)?.trim().to_string();
                let task_id = setup_dapi_res_receiver(
                    session,
                    self.state.waiters.clone(),
                    request_id,
                    self.state.config.max_time_receiving_string,
                );
                Ok(Some(("ok".to_string(), Bytes::from(task_id))))
            }
            _ => dispatch_common(session, command, payload).await,
        }
    }

    async fn session_closed(&self, _session: &Arc<Session>) {
        self.state.clear_session();
        info!("Disconnected from master.");
    }
}

/// Decompresses and applies the master's integrity reply, scheduling an
/// extra-valid upload when the master asked for group files.
async fn process_master_reply(
    state: &Arc<WorkerState>,
    session: &Arc<Session>,
    path: &PathBuf,
) -> Result<(), SentraError> {
    info!("Analyzing received files: Start.");
    let bytes = tokio::fs::read(path).await?;
    let reply: IntegrityReply = tokio::task::spawn_blocking(move || bundle::decompress(&bytes))
        .await
        .map_err(|e| SentraError::Internal(format!("decompress task failed: {e}")))??;

    let (missing, shared, extra, extra_valid) = reply.classified.totals();
    info!(
        "Analyzing received files: Missing: {}. Shared: {}. Extra: {}. ExtraValid: {}",
        missing, shared, extra, extra_valid
    );

    if !reply.classified.extra_valid.is_empty() {
        info!("Master requires some worker files.");
        let state = state.clone();
        let session = session.clone();
        let files = reply.classified.extra_valid.clone();
        tokio::spawn(async move {
            let before = Instant::now();
            match sync_cycle(&state, &session, SyncKind::ExtraValid(files)).await {
                Ok(_) => debug!(
                    "Time synchronizing extra valid files: {:.3} s",
                    before.elapsed().as_secs_f64()
                ),
                Err(e) => error!("Extra valid synchronization failed: {}", e),
            }
        });
    }

    if missing == 0 && shared == 0 && extra == 0 {
        info!("Worker meets integrity checks. No actions.");
        return Ok(());
    }

    info!("Worker does not meet integrity checks. Updating files: Start.");
    let root = state.config.data_dir.clone();
    let manifest = state.manifest.clone();
    let hook = state.agent_removal_hook.clone();
    let counters = tokio::task::spawn_blocking(move || {
        apply::apply_integrity_reply(&root, &manifest, &reply, NodeType::Worker, hook.as_ref())
    })
    .await
    .map_err(|e| SentraError::Internal(format!("apply task failed: {e}")))?;
    info!(
        "Updating files: End. {} updated, {} removed, {} errors.",
        counters.updated,
        counters.removed,
        counters.total_errors()
    );
    Ok(())
}

/// The control-socket backend of a worker node: distributed requests route
/// through the local router, registry queries ask the master over the wire.
pub struct WorkerControl(pub Arc<WorkerState>);

impl WorkerControl {
    async fn registry_query(&self, command: &str, args: Value) -> Result<Value, SentraError> {
        let session = self.0.master_session()?;
        let payload = if args.is_null() {
            Bytes::new()
        } else {
            Bytes::from(args.to_string())
        };
        let reply = session.execute(command, payload).await?.into_result()?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

#[async_trait::async_trait]
impl crate::core::control::ControlBackend for WorkerControl {
    async fn dapi(&self, request: ApiRequest) -> Value {
        self.0.router().distribute(request).await
    }

    async fn dapi_forward(&self, node: &str, request: ApiRequest) -> Value {
        match self.0.router().link.forward(Some(node), &request).await {
            Ok(response) => response,
            Err(e) => crate::core::dispatch::envelope_err(e.code(), e.to_string()),
        }
    }

    async fn get_nodes(&self, args: Value) -> Result<Value, SentraError> {
        self.registry_query("get_nodes", args).await
    }

    async fn get_health(&self, filter: Value) -> Result<Value, SentraError> {
        self.registry_query("get_health", filter).await
    }
}
