// src/core/cluster/master.rs

//! The master runtime: accepts worker connections, keeps the registry of
//! connected workers with their per-category sync state, reacts to the
//! worker-driven sync cycles, and relays distributed requests.

use crate::config::Config;
use crate::core::SentraError;
use crate::core::cluster::{NodeIdentity, NodeType};
use crate::core::dispatch::router::{
    ClusterLink, DapiWaiters, Router, forward_over_session, setup_dapi_res_receiver,
    spawn_dapi_execution, split_request_id,
};
use crate::core::dispatch::{AgentDirectory, ApiRequest, FunctionRegistry, envelope_err};
use crate::core::protocol::PayloadCipher;
use crate::core::session::{RequestDispatcher, Session, dispatch_common, tasks, transfer};
use crate::core::sync::state::IntegrityTotals;
use crate::core::sync::{SourceKind, SyncCategory, SyncStatus, apply, bundle, scanner};
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// One connected worker, as the master sees it.
pub struct WorkerPeer {
    pub identity: NodeIdentity,
    pub ip: String,
    pub session: Arc<Session>,
    pub status: parking_lot::Mutex<SyncStatus>,
    pub waiters: Arc<DapiWaiters>,
}

/// Shared master-side state.
pub struct MasterState {
    pub config: Arc<Config>,
    pub identity: NodeIdentity,
    pub manifest: Arc<crate::core::sync::ClusterItems>,
    pub registry: Arc<FunctionRegistry>,
    pub directory: Arc<dyn AgentDirectory>,
    pub workers: DashMap<String, Arc<WorkerPeer>>,
    router: OnceCell<Arc<Router>>,
}

impl MasterState {
    pub fn new(
        config: Arc<Config>,
        manifest: Arc<crate::core::sync::ClusterItems>,
        registry: Arc<FunctionRegistry>,
        directory: Arc<dyn AgentDirectory>,
    ) -> Arc<Self> {
        let identity = config.identity();
        let state = Arc::new(Self {
            config,
            identity,
            manifest,
            registry: registry.clone(),
            directory: directory.clone(),
            workers: DashMap::new(),
            router: OnceCell::new(),
        });
        let link = Arc::new(MasterLink {
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

    fn worker(&self, name: &str) -> Result<Arc<WorkerPeer>, SentraError> {
        self.workers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SentraError::NodeNotConnected(name.to_string()))
    }

    /// Sends the same request to every connected worker and collects the
    /// per-worker outcomes.
    pub async fn broadcast(
        &self,
        command: &str,
        payload: Bytes,
    ) -> Vec<(String, Result<crate::core::session::Reply, SentraError>)> {
        let peers: Vec<Arc<WorkerPeer>> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut responses = Vec::with_capacity(peers.len());
        for peer in peers {
            let outcome = peer.session.execute(command, payload.clone()).await;
            responses.push((peer.identity.node_name.clone(), outcome));
        }
        responses
    }

    /// The registry view served to `get_nodes`.
    pub fn nodes_view(&self, args: &Value) -> Value {
        let filter_node = filter_set(args, "filter_node");
        let filter_type = args
            .get("filter_type")
            .and_then(Value::as_str)
            .unwrap_or("all")
            .to_string();

        let mut items = Vec::new();
        if filter_type == "all" || filter_type == "master" {
            items.push(json!({
                "name": self.identity.node_name,
                "type": "master",
                "version": self.identity.version.to_string(),
                "ip": "localhost",
            }));
        }
        if filter_type == "all" || filter_type == "worker" {
            let mut names: Vec<String> =
                self.workers.iter().map(|e| e.key().clone()).collect();
            names.sort();
            for name in names {
                if let Ok(peer) = self.worker(&name) {
                    items.push(json!({
                        "name": peer.identity.node_name,
                        "type": "worker",
                        "version": peer.identity.version.to_string(),
                        "ip": peer.ip,
                    }));
                }
            }
        }
        if let Some(wanted) = filter_node {
            items.retain(|item| {
                item.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| wanted.iter().any(|w| w == name))
            });
        }

        json!({ "items": items, "totalItems": items.len() })
    }

    /// The per-worker sync health served to `get_health`.
    pub fn health_view(&self, filter: &Value) -> Value {
        let filter_node = filter_set(filter, "filter_node");
        let mut nodes = serde_json::Map::new();

        let include = |name: &str| {
            filter_node
                .as_ref()
                .map(|wanted| wanted.iter().any(|w| w == name))
                .unwrap_or(true)
        };

        if include(&self.identity.node_name) {
            nodes.insert(
                self.identity.node_name.clone(),
                json!({
                    "info": {
                        "name": self.identity.node_name,
                        "type": "master",
                        "version": self.identity.version.to_string(),
                        "ip": "localhost",
                    }
                }),
            );
        }
        for entry in self.workers.iter() {
            let peer = entry.value();
            if !include(&peer.identity.node_name) {
                continue;
            }
            nodes.insert(
                peer.identity.node_name.clone(),
                json!({
                    "info": {
                        "name": peer.identity.node_name,
                        "type": "worker",
                        "version": peer.identity.version.to_string(),
                        "ip": peer.ip,
                    },
                    "status": peer.status.lock().to_json(),
                }),
            );
        }

        json!({ "n_connected_nodes": self.workers.len(), "nodes": nodes })
    }
}

fn filter_set(args: &Value, key: &str) -> Option<Vec<String>> {
    match args.get(key)? {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

/// The master's view of the cluster for the request router.
struct MasterLink {
    state: Weak<MasterState>,
}

#[async_trait::async_trait]
impl ClusterLink for MasterLink {
    fn node_name(&self) -> String {
        self.state
            .upgrade()
            .map(|s| s.identity.node_name.clone())
            .unwrap_or_default()
    }

    fn node_type(&self) -> NodeType {
        NodeType::Master
    }

    fn master_name(&self) -> String {
        self.node_name()
    }

    async fn forward(
        &self,
        node: Option<&str>,
        request: &ApiRequest,
    ) -> Result<Value, SentraError> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| SentraError::Internal("master state dropped".into()))?;
        let name = node.ok_or_else(|| {
            SentraError::Internal("the master cannot forward to itself".into())
        })?;
        let peer = state.worker(name)?;
        let deadline = (!request.wait_for_complete).then(|| state.config.request_timeout);
        forward_over_session(&peer.session, &peer.waiters, None, request, deadline).await
    }
}

/// Accept loop: one session per incoming worker connection.
pub async fn run(
    state: Arc<MasterState>,
    cipher: Option<PayloadCipher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), SentraError> {
    let addr = (state.config.bind_addr.as_str(), state.config.port);
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Master listening on {}:{}",
        state.config.bind_addr, state.config.port
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Master accept loop shutting down.");
                let sessions: Vec<Arc<Session>> = state
                    .workers
                    .iter()
                    .map(|entry| entry.value().session.clone())
                    .collect();
                for session in sessions {
                    session.close().await;
                }
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("Incoming connection from {}", peer_addr);
                        let handler = Arc::new(MasterSessionHandler::new(
                            state.clone(),
                            peer_addr.ip().to_string(),
                        ));
                        let _ = Session::spawn(
                            socket,
                            cipher.clone(),
                            handler,
                            peer_addr.to_string(),
                        );
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
        }
    }
}

/// Per-connection request handler on the master side.
pub struct MasterSessionHandler {
    state: Arc<MasterState>,
    addr: String,
    /// Set once the hello is accepted.
    peer_name: OnceLock<String>,
    /// Receptions opened by `sync_*_w_m`, completed by `sync_*_w_m_e`.
    uploads: DashMap<String, oneshot::Receiver<Result<PathBuf, SentraError>>>,
}

impl MasterSessionHandler {
    pub fn new(state: Arc<MasterState>, addr: String) -> Self {
        Self {
            state,
            addr,
            peer_name: OnceLock::new(),
            uploads: DashMap::new(),
        }
    }

    fn peer(&self) -> Result<Arc<WorkerPeer>, SentraError> {
        let name = self
            .peer_name
            .get()
            .ok_or_else(|| SentraError::HandshakeRejected("hello not received yet".into()))?;
        self.state.worker(name)
    }

    /// Validates a worker hello and registers the peer. Failures close the
    /// socket without a reply; the initiator times out.
    async fn handle_hello(&self, session: &Arc<Session>, payload: Bytes) {
        let outcome = self.try_register(session, &payload);
        match outcome {
            Ok(name) => {
                info!("[Master] [{}]: Connected.", name);
            }
            Err(e) => {
                error!(
                    "[Master] Error accepting connection from {}: {}",
                    self.addr, e
                );
                session.close().await;
            }
        }
    }

    fn try_register(
        &self,
        session: &Arc<Session>,
        payload: &[u8],
    ) -> Result<String, SentraError> {
        let text = std::str::from_utf8(payload)?;
        let identity = NodeIdentity::from_hello(text)?;

        let me = &self.state.identity;
        if !identity.version.is_compatible_with(&me.version) {
            return Err(SentraError::HandshakeRejected(format!(
                "incompatible worker version ({})",
                identity.version
            )));
        }
        if identity.node_type != NodeType::Worker {
            return Err(SentraError::HandshakeRejected(format!(
                "only workers may connect, got '{}'",
                identity.node_type
            )));
        }
        if identity.cluster_name != me.cluster_name {
            return Err(SentraError::HandshakeRejected(format!(
                "worker belongs to cluster '{}', this is '{}'",
                identity.cluster_name, me.cluster_name
            )));
        }
        if identity.node_name == me.node_name {
            return Err(SentraError::HandshakeRejected(format!(
                "worker name '{}' collides with the master's",
                identity.node_name
            )));
        }

        let name = identity.node_name.clone();
        match self.state.workers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SentraError::HandshakeRejected(format!(
                    "there is already a node named '{name}' connected"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(WorkerPeer {
                    identity,
                    ip: self.addr.clone(),
                    session: session.clone(),
                    status: parking_lot::Mutex::new(SyncStatus::default()),
                    waiters: Arc::new(DapiWaiters::new()),
                }));
            }
        }
        self.peer_name
            .set(name.clone())
            .map_err(|_| SentraError::HandshakeRejected("duplicate hello".into()))?;
        Ok(name)
    }

    /// Answers a `sync_*_p` permission request, clearing the gate on grant.
    fn permission(&self, category: SyncCategory) -> Result<(String, Bytes), SentraError> {
        let peer = self.peer()?;
        let granted = peer.status.lock().try_acquire(category);
        debug!(
            "[Master] [{}]: {} sync permission {}",
            peer.identity.node_name,
            category,
            if granted { "granted" } else { "denied" }
        );
        let payload: &'static [u8] = if granted { b"true" } else { b"false" };
        Ok(("ok".to_string(), Bytes::from_static(payload)))
    }

    /// Opens the reception of a worker upload and hands back the task-id.
    fn setup_upload(
        &self,
        session: &Arc<Session>,
        command: &str,
    ) -> Result<(String, Bytes), SentraError> {
        let peer = self.peer()?;
        let (task_id, chunk_rx) = session.tasks().register(command, None);
        let dest = self
            .state
            .config
            .data_dir
            .join("queue/cluster")
            .join(&peer.identity.node_name)
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
        Ok(("ok".to_string(), Bytes::from(task_id)))
    }

    /// Completes an upload and spawns the category-specific processing.
    async fn end_upload(
        &self,
        category: SyncCategory,
        payload: Bytes,
    ) -> Result<(String, Bytes), SentraError> {
        let text = std::str::from_utf8(&payload)?;
        let task_id = text.split(' ').next().unwrap_or_default().to_string();
        let peer = self.peer()?;

        let Some((_, done_rx)) = self.uploads.remove(&task_id) else {
            // The worker aborted mid-cycle; restore the gate so the next
            // tick can run.
            peer.status.lock().release(category);
            return Err(SentraError::TaskNotFound(task_id));
        };

        let received = match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(SentraError::TransportClosed),
        };
        let path = match received {
            Ok(path) => path,
            Err(e) => {
                peer.status.lock().release(category);
                return Err(e);
            }
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            let result = match category {
                SyncCategory::Integrity => process_integrity(&state, &peer, &path).await,
                SyncCategory::AgentInfo => process_agent_info(&state, &peer, &path).await,
                SyncCategory::ExtraValid => process_extra_valid(&state, &peer, &path).await,
            };
            if let Err(e) = result {
                error!(
                    "[Master] [{}]: {} sync failed: {}",
                    peer.identity.node_name, category, e
                );
            }
            peer.status.lock().release(category);
            let _ = tokio::fs::remove_file(&path).await;
        });

        Ok((
            "ok".to_string(),
            Bytes::from_static(b"File correctly received"),
        ))
    }
}

#[async_trait::async_trait]
impl RequestDispatcher for MasterSessionHandler {
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        command: &str,
        payload: Bytes,
    ) -> Result<Option<(String, Bytes)>, SentraError> {
        match command {
            "hello" => {
                self.handle_hello(session, payload).await;
                Ok(None)
            }
            "sync_i_w_m_p" => self.permission(SyncCategory::Integrity).map(Some),
            "sync_a_w_m_p" => self.permission(SyncCategory::AgentInfo).map(Some),
            "sync_e_w_m_p" => self.permission(SyncCategory::ExtraValid).map(Some),
            "sync_i_w_m" | "sync_a_w_m" | "sync_e_w_m" => {
                self.setup_upload(session, command).map(Some)
            }
            "sync_i_w_m_e" => self.end_upload(SyncCategory::Integrity, payload).await.map(Some),
            "sync_a_w_m_e" => self.end_upload(SyncCategory::AgentInfo, payload).await.map(Some),
            "sync_e_w_m_e" => self.end_upload(SyncCategory::ExtraValid, payload).await.map(Some),
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
            "dapi_forward" => {
                let (request_id, rest) = split_request_id(&payload)?;
                let (node, request_json) = rest
                    .split_once(' ')
                    .map(|(n, j)| (n.to_string(), j.to_string()))
                    .ok_or_else(|| {
                        SentraError::Internal("dapi_forward payload without target".into())
                    })?;
                self.relay(session, request_id, node, request_json);
                Ok(Some((
                    "ok".to_string(),
                    Bytes::from_static(b"Added request to API requests queue"),
                )))
            }
            "dapi_res" => {
                let peer = self.peer()?;
                let request_id = std::str::from_utf8(&payload)?.trim().to_string();
                let task_id = setup_dapi_res_receiver(
                    session,
                    peer.waiters.clone(),
                    request_id,
                    self.state.config.max_time_receiving_string,
                );
                Ok(Some(("ok".to_string(), Bytes::from(task_id))))
            }
            "get_nodes" => {
                let args: Value =
                    serde_json::from_slice(&payload).unwrap_or(Value::Null);
                let view = self.state.nodes_view(&args);
                Ok(Some(("json".to_string(), Bytes::from(view.to_string()))))
            }
            "get_health" => {
                let args: Value =
                    serde_json::from_slice(&payload).unwrap_or(Value::Null);
                let view = self.state.health_view(&args);
                Ok(Some(("json".to_string(), Bytes::from(view.to_string()))))
            }
            _ => dispatch_common(session, command, payload).await,
        }
    }

    async fn session_closed(&self, _session: &Arc<Session>) {
        if let Some(name) = self.peer_name.get() {
            self.state.workers.remove(name);
            info!("[Master] [{}]: Disconnected.", name);
        } else {
            info!("[Master] Connection with {} closed.", self.addr);
        }
    }
}

impl MasterSessionHandler {
    /// Relays a worker-originated request to another worker (or answers it
    /// locally when this master is the target) and streams the result back
    /// to the origin session.
    fn relay(
        &self,
        session: &Arc<Session>,
        request_id: String,
        node: String,
        request_json: String,
    ) {
        let state = self.state.clone();
        let origin = session.clone();
        tokio::spawn(async move {
            let response = match serde_json::from_str::<ApiRequest>(&request_json) {
                Ok(request) => {
                    if node == state.identity.node_name {
                        state.router().distribute(request).await
                    } else {
                        match state.worker(&node) {
                            Ok(peer) => {
                                let deadline = (!request.wait_for_complete)
                                    .then(|| state.config.request_timeout);
                                match forward_over_session(
                                    &peer.session,
                                    &peer.waiters,
                                    None,
                                    &request,
                                    deadline,
                                )
                                .await
                                {
                                    Ok(response) => response,
                                    Err(e) => envelope_err(e.code(), e.to_string()),
                                }
                            }
                            Err(e) => envelope_err(e.code(), e.to_string()),
                        }
                    }
                }
                Err(e) => envelope_err(1000, format!("malformed request: {e}")),
            };
            let text = response.to_string();
            if let Err(e) = transfer::send_string(
                &origin,
                "dapi_res",
                Bytes::from(request_id.clone()),
                text.as_bytes(),
                state.config.interval.string_transfer_send,
            )
            .await
            {
                error!("Could not relay response for request {}: {}", request_id, e);
            }
        });
    }
}

// --- Category-specific processing of completed uploads ---

/// Diffs the worker's integrity index against the master's own scan and
/// streams the reply bundle back (or `sync_m_c_ok` when the worker already
/// meets integrity).
async fn process_integrity(
    state: &Arc<MasterState>,
    peer: &Arc<WorkerPeer>,
    path: &PathBuf,
) -> Result<(), SentraError> {
    let worker_name = peer.identity.node_name.clone();
    info!("[Master] [{}]: Analyzing integrity index.", worker_name);

    let bytes = tokio::fs::read(path).await?;
    let root = state.config.data_dir.clone();
    let manifest = state.manifest.clone();
    let staging_name = worker_name.clone();

    let (classified, staged) = tokio::task::spawn_blocking(move || {
        let upload: bundle::SyncBundle = bundle::decompress(&bytes)?;
        let master_index =
            scanner::scan_files(&root, &manifest, SourceKind::Master, NodeType::Master, true)?;
        let classified = scanner::classify(&master_index, &upload.index, &manifest);
        if classified.is_clean() {
            return Ok::<_, SentraError>((classified, None));
        }

        let mut to_send = classified.missing.clone();
        to_send.extend(classified.shared.clone());
        let reply = bundle::IntegrityReply {
            classified: classified.clone(),
            files: bundle::read_bodies(&root, &to_send),
        };
        let compressed = bundle::compress(&reply)?;
        let staged = bundle::stage(&root, &staging_name, "integrity-reply", &compressed)?;
        Ok((classified, Some(staged)))
    })
    .await
    .map_err(|e| SentraError::Internal(format!("integrity check task failed: {e}")))??;

    let (missing, shared, extra, extra_valid) = classified.totals();
    info!(
        "[Master] [{}]: Missing: {}. Shared: {}. Extra: {}. ExtraValid: {}.",
        worker_name, missing, shared, extra, extra_valid
    );

    match staged {
        None => {
            info!("[Master] [{}]: Worker meets integrity checks. No actions.", worker_name);
            peer.session
                .execute_str("sync_m_c_ok", "")
                .await?
                .into_result()?;
        }
        Some(staged) => {
            let task_id = transfer::send_file(
                &peer.session,
                "sync_m_c",
                Bytes::from_static(b"integrity-reply.bundle"),
                &staged,
                state.config.interval.file_transfer_send,
            )
            .await?;
            peer.session
                .execute_str("sync_m_c_e", &format!("{task_id} integrity-reply.bundle"))
                .await?
                .into_result()?;
            let _ = tokio::fs::remove_file(&staged).await;
        }
    }

    peer.status.lock().finish_integrity(IntegrityTotals {
        missing,
        shared,
        extra,
        extra_valid,
    });
    Ok(())
}

/// Applies a worker's agent-status upload unconditionally (except the
/// stale-mtime guard).
async fn process_agent_info(
    state: &Arc<MasterState>,
    peer: &Arc<WorkerPeer>,
    path: &PathBuf,
) -> Result<(), SentraError> {
    let bytes = tokio::fs::read(path).await?;
    let root = state.config.data_dir.clone();

    let (applied, discarded) = tokio::task::spawn_blocking(move || {
        let upload: bundle::SyncBundle = bundle::decompress(&bytes)?;
        Ok::<_, SentraError>(apply::apply_agent_info(&root, &upload.files, &upload.index))
    })
    .await
    .map_err(|e| SentraError::Internal(format!("agent-info apply task failed: {e}")))??;

    info!(
        "[Master] [{}]: Agent status sync: {} applied, {} discarded.",
        peer.identity.node_name, applied, discarded
    );
    peer.status.lock().finish_agent_info(applied);
    Ok(())
}

/// Unmerges and applies the worker's agent-group containers.
async fn process_extra_valid(
    state: &Arc<MasterState>,
    peer: &Arc<WorkerPeer>,
    path: &PathBuf,
) -> Result<(), SentraError> {
    let bytes = tokio::fs::read(path).await?;
    let root = state.config.data_dir.clone();

    let applied = tokio::task::spawn_blocking(move || {
        let upload: bundle::SyncBundle = bundle::decompress(&bytes)?;
        let mut applied = 0usize;
        for (relpath, content) in &upload.files {
            let Some(meta) = upload.index.get(relpath) else {
                continue;
            };
            if meta.merged {
                applied += apply::apply_merged(&root, content, meta, NodeType::Master, None)?;
            } else {
                apply::update_file(&root, relpath, content, meta, NodeType::Master, None)?;
                applied += 1;
            }
        }
        Ok::<_, SentraError>(applied)
    })
    .await
    .map_err(|e| SentraError::Internal(format!("extra-valid apply task failed: {e}")))??;

    info!(
        "[Master] [{}]: Extra-valid sync: {} group files merged.",
        peer.identity.node_name, applied
    );
    peer.status.lock().finish_agent_groups(applied);
    Ok(())
}

/// The control-socket backend of a master node.
pub struct MasterControl(pub Arc<MasterState>);

#[async_trait::async_trait]
impl crate::core::control::ControlBackend for MasterControl {
    async fn dapi(&self, request: ApiRequest) -> Value {
        self.0.router().distribute(request).await
    }

    async fn dapi_forward(&self, node: &str, request: ApiRequest) -> Value {
        if node == self.0.identity.node_name {
            return self.0.router().distribute(request).await;
        }
        match self.0.router().link.forward(Some(node), &request).await {
            Ok(response) => response,
            Err(e) => envelope_err(e.code(), e.to_string()),
        }
    }

    async fn get_nodes(&self, args: Value) -> Result<Value, SentraError> {
        Ok(self.0.nodes_view(&args))
    }

    async fn get_health(&self, filter: Value) -> Result<Value, SentraError> {
        Ok(self.0.health_view(&filter))
    }
}
