// src/core/dispatch/router.rs

//! Routes a typed request to the node that can answer it and carries the
//! replies back.
//!
//! Routing is a single match on the registered request type. Cross-node legs
//! travel as `dapi` / `dapi_forward` frames over the peer session; because
//! replies can exceed the frame limit, the responder streams the result JSON
//! back as a `dapi_res` string transfer tagged with the request id, which
//! the originator resolves through its waiter table.

use crate::core::SentraError;
use crate::core::cluster::NodeType;
use crate::core::dispatch::solver::{SolverTarget, get_solver_node};
use crate::core::dispatch::{
    AgentDirectory, ApiRequest, FunctionRegistry, RequestType, envelope_err, merge,
};
use crate::core::session::{Session, transfer};
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

/// Default pagination window applied when the caller gives no limit.
pub const DEFAULT_LIMIT: usize = 500;

/// Outstanding forwarded requests, keyed by request id. The `dapi_res`
/// receiver resolves entries as the reply strings complete.
#[derive(Default)]
pub struct DapiWaiters {
    waiting: DashMap<String, oneshot::Sender<String>>,
}

impl DapiWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(request_id.to_string(), tx);
        rx
    }

    pub fn resolve(&self, request_id: &str, response: String) -> bool {
        match self.waiting.remove(request_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, request_id: &str) {
        self.waiting.remove(request_id);
    }
}

/// How the router reaches other nodes. One implementation per node role.
#[async_trait::async_trait]
pub trait ClusterLink: Send + Sync + 'static {
    fn node_name(&self) -> String;
    fn node_type(&self) -> NodeType;
    /// The master's node name (its own on the master).
    fn master_name(&self) -> String;
    /// Forwards a request: `None` targets the master, `Some(name)` a
    /// specific node. Returns the peer's response envelope.
    async fn forward(&self, node: Option<&str>, request: &ApiRequest)
    -> Result<Value, SentraError>;
}

/// The request router for one node.
pub struct Router {
    pub registry: Arc<FunctionRegistry>,
    pub directory: Arc<dyn AgentDirectory>,
    pub link: Arc<dyn ClusterLink>,
}

impl Router {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        directory: Arc<dyn AgentDirectory>,
        link: Arc<dyn ClusterLink>,
    ) -> Self {
        Self {
            registry,
            directory,
            link,
        }
    }

    /// Routes one request and returns the response envelope. Never errors:
    /// failures become `{"message": ..., "error": code}` envelopes.
    pub async fn distribute(&self, mut request: ApiRequest) -> Value {
        let Some(request_type) = self.registry.request_type(&request.function) else {
            let e = SentraError::UnknownFunction(request.function.clone());
            return envelope_err(e.code(), e.to_string());
        };

        let is_master = self.link.node_type() == NodeType::Master;
        match request_type {
            RequestType::LocalAny => self.registry.execute_local(&request).await,
            RequestType::LocalMaster | RequestType::Remote => {
                if is_master {
                    self.registry.execute_local(&request).await
                } else {
                    self.forward_or_err(None, &request).await
                }
            }
            RequestType::DistributedMaster => {
                if request.from_cluster {
                    // Already routed once; this node is the solver.
                    self.registry.execute_local(&request).await
                } else if is_master {
                    self.fan_out(&mut request).await
                } else {
                    self.forward_or_err(None, &request).await
                }
            }
        }
    }

    /// Resolves the solver map and fans the request out, merging the
    /// per-node envelopes.
    async fn fan_out(&self, request: &mut ApiRequest) -> Value {
        let master_name = self.link.master_name();
        let target = match get_solver_node(request, self.directory.as_ref(), &master_name).await {
            Ok(target) => target,
            Err(e) => return envelope_err(e.code(), e.to_string()),
        };
        request.from_cluster = true;

        match target {
            SolverTarget::Node(node) => {
                if node == self.link.node_name() {
                    self.registry.execute_local(request).await
                } else {
                    self.forward_or_err(Some(&node), request).await
                }
            }
            SolverTarget::Fanout(by_node) => {
                // Forwarded legs fetch full result sets; the original window
                // is re-applied after the merge.
                let offset = take_usize(request, "offset").unwrap_or(0);
                let limit = take_usize(request, "limit");

                let mut legs = Vec::new();
                for (node, agent_ids) in by_node {
                    let mut leg = request.clone();
                    if !agent_ids.is_empty() {
                        leg.arguments.insert(
                            "agent_id".to_string(),
                            Value::Array(agent_ids.into_iter().map(Value::from).collect()),
                        );
                    }
                    legs.push(async move {
                        if node == self.link.node_name() {
                            self.registry.execute_local(&leg).await
                        } else {
                            self.forward_or_err(Some(&node), &leg).await
                        }
                    });
                }

                let responses = futures::future::join_all(legs).await;
                merge::merge_results(&responses, offset, Some(limit.unwrap_or(DEFAULT_LIMIT)))
            }
        }
    }

    async fn forward_or_err(&self, node: Option<&str>, request: &ApiRequest) -> Value {
        match self.link.forward(node, request).await {
            Ok(response) => response,
            Err(e) => envelope_err(e.code(), e.to_string()),
        }
    }
}

/// Pops a non-negative integer argument, tolerating string forms.
fn take_usize(request: &mut ApiRequest, key: &str) -> Option<usize> {
    let value = request.arguments.remove(key)?;
    value
        .as_u64()
        .map(|n| n as usize)
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

// --- Wire glue shared by both node roles ---

/// Sends a request to the peer on `session` and awaits the `dapi_res`
/// transfer that carries the reply. `target` selects `dapi_forward <node>`
/// relaying on the master; `None` executes on the receiving peer.
pub async fn forward_over_session(
    session: &Arc<Session>,
    waiters: &Arc<DapiWaiters>,
    target: Option<&str>,
    request: &ApiRequest,
    deadline: Option<Duration>,
) -> Result<Value, SentraError> {
    let request_id = Uuid::new_v4().to_string();
    let rx = waiters.register(&request_id);
    let request_json = serde_json::to_string(request)?;

    let (command, payload) = match target {
        Some(node) => ("dapi_forward", format!("{request_id} {node} {request_json}")),
        None => ("dapi", format!("{request_id} {request_json}")),
    };

    let accepted = match session.execute_str(command, &payload).await {
        Ok(reply) => reply.into_result(),
        Err(e) => Err(e),
    };
    if let Err(e) = accepted {
        waiters.forget(&request_id);
        return Err(e);
    }

    let response = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, rx).await {
            Ok(result) => result,
            Err(_) => {
                // The in-flight transfer keeps running to completion; only
                // the waiter gives up, to avoid desyncing the stream.
                waiters.forget(&request_id);
                return Err(SentraError::RequestTimeout);
            }
        },
        None => rx.await,
    }
    .map_err(|_| SentraError::TransportClosed)?;

    Ok(serde_json::from_str(&response)?)
}

/// Splits a `dapi` / `dapi_forward` payload into its request id and the
/// remainder.
pub fn split_request_id(payload: &[u8]) -> Result<(String, String), SentraError> {
    let text = std::str::from_utf8(payload)?;
    let (request_id, rest) = text
        .split_once(' ')
        .ok_or_else(|| SentraError::Internal("dapi payload without request id".into()))?;
    Ok((request_id.to_string(), rest.to_string()))
}

/// Executes a request arriving from a peer and streams the response back as
/// a `dapi_res` string transfer tagged with `request_id`.
pub fn spawn_dapi_execution(
    router: Arc<Router>,
    session: Arc<Session>,
    request_id: String,
    request_json: String,
    throttle: Duration,
) {
    tokio::spawn(async move {
        let response = match serde_json::from_str::<ApiRequest>(&request_json) {
            Ok(request) => router.distribute(request).await,
            Err(e) => envelope_err(1000, format!("malformed request: {e}")),
        };
        let text = response.to_string();
        if let Err(e) = transfer::send_string(
            &session,
            "dapi_res",
            Bytes::from(request_id.clone()),
            text.as_bytes(),
            throttle,
        )
        .await
        {
            error!("Could not return response for request {}: {}", request_id, e);
        }
    });
}

/// Handles an incoming `dapi_res` reason frame: registers the string
/// receiver whose completion resolves the local waiter. Returns the task-id
/// to answer the peer with.
pub fn setup_dapi_res_receiver(
    session: &Arc<Session>,
    waiters: Arc<DapiWaiters>,
    request_id: String,
    max_idle: Duration,
) -> String {
    let (task_id, rx) = session.tasks().register("dapi_res", None);
    let session = session.clone();
    let registry_task_id = task_id.clone();
    tokio::spawn(async move {
        let result = crate::core::session::tasks::receive_string(rx, max_idle).await;
        session.tasks().remove(&registry_task_id);
        match result {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                if !waiters.resolve(&request_id, text) {
                    debug!("No waiter for request {}", request_id);
                }
            }
            Err(e) => {
                error!("Failed receiving response for request {}: {}", request_id, e);
                waiters.forget(&request_id);
            }
        }
    });
    task_id
}
