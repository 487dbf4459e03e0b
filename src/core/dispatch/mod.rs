// src/core/dispatch/mod.rs

//! The distributed-request dispatcher: typed requests, the function
//! registry, and the routing/merging machinery built on top of it.
//!
//! The business logic behind individual functions is opaque to the runtime:
//! the registry maps a function name to a request type and an async handler,
//! is populated once at startup, and is immutable afterwards.

pub mod merge;
pub mod router;
pub mod solver;

use crate::core::SentraError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Where a registered function may run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestType {
    /// Always execute on the receiving node.
    LocalAny,
    /// Execute on the master; workers forward.
    LocalMaster,
    /// Resolve the solver node(s) on the master, fan out, merge.
    DistributedMaster,
    /// Execute on the master.
    Remote,
}

/// A request entering the dispatcher, from the API layer or a peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub function: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Set when the request has already been routed across the cluster once;
    /// the receiving node must execute it locally.
    #[serde(default)]
    pub from_cluster: bool,
    /// When false, forwarded legs run under the per-route deadline.
    #[serde(default = "default_wait_for_complete")]
    pub wait_for_complete: bool,
}

fn default_wait_for_complete() -> bool {
    true
}

impl ApiRequest {
    pub fn new(function: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            function: function.into(),
            arguments,
            from_cluster: false,
            wait_for_complete: true,
        }
    }
}

/// The future a registered handler returns.
pub type HandlerFuture = BoxFuture<'static, Result<Value, SentraError>>;
/// An opaque business-logic handler.
pub type HandlerFn = Arc<dyn Fn(Map<String, Value>) -> HandlerFuture + Send + Sync>;

struct RegisteredFunction {
    request_type: RequestType,
    handler: HandlerFn,
}

/// The process-wide function registry. Built once at startup and shared as
/// an immutable `Arc`; there is deliberately no way to mutate it afterwards.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function. Startup-time only.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        request_type: RequestType,
        handler: HandlerFn,
    ) {
        self.functions.insert(
            name.into(),
            RegisteredFunction {
                request_type,
                handler,
            },
        );
    }

    pub fn request_type(&self, function: &str) -> Option<RequestType> {
        self.functions.get(function).map(|f| f.request_type)
    }

    /// Runs a function locally and wraps the outcome in the response
    /// envelope.
    pub async fn execute_local(&self, request: &ApiRequest) -> Value {
        match self.functions.get(&request.function) {
            Some(registered) => {
                match (registered.handler)(request.arguments.clone()).await {
                    Ok(data) => envelope_ok(data),
                    Err(e) => envelope_err(e.code(), e.to_string()),
                }
            }
            None => {
                let e = SentraError::UnknownFunction(request.function.clone());
                envelope_err(e.code(), e.to_string())
            }
        }
    }
}

/// A successful response envelope: `{"data": ..., "error": 0}`.
pub fn envelope_ok(data: Value) -> Value {
    json!({ "data": data, "error": 0 })
}

/// A failed response envelope: `{"message": ..., "error": code}`.
pub fn envelope_err(code: u16, message: impl Into<String>) -> Value {
    json!({ "message": message.into(), "error": code })
}

/// One row of the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub id: String,
    pub node_name: String,
}

/// The registry the solver queries to find each agent's home node. The
/// backing store (per-agent databases) is outside this crate.
#[async_trait::async_trait]
pub trait AgentDirectory: Send + Sync + 'static {
    /// Returns `(id, node_name)` rows, restricted to `filter_ids` when given.
    async fn agents_overview(
        &self,
        filter_ids: Option<&[String]>,
    ) -> Result<Vec<AgentRecord>, SentraError>;
}

/// A directory with no agents; the default when the embedder registers none.
pub struct EmptyDirectory;

#[async_trait::async_trait]
impl AgentDirectory for EmptyDirectory {
    async fn agents_overview(
        &self,
        _filter_ids: Option<&[String]>,
    ) -> Result<Vec<AgentRecord>, SentraError> {
        Ok(Vec::new())
    }
}
