// src/core/errors.rs

//! Defines the primary error type for the entire daemon.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the cluster
/// runtime. Using `thiserror` allows for clean error definitions and automatic
/// `From` trait implementations.
///
/// Every variant maps to a stable numeric code (see [`SentraError::code`])
/// which is what travels through the API layer; the Rust type never leaves
/// the process.
#[derive(Error, Debug)]
pub enum SentraError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    // --- Transport errors: these tear down the session. ---
    #[error("Could not decrypt message. Check the cluster key is correct")]
    BadAuth,

    #[error("Frame of {got} bytes exceeds maximum allowed {max}")]
    Oversize { got: usize, max: usize },

    #[error("Session closed while waiting for a response")]
    TransportClosed,

    #[error("Command of length {0} exceeds maximum allowed {1}")]
    CommandTooLong(usize, usize),

    // --- Protocol errors: scoped to a single exchange. ---
    #[error("Unknown command received '{0}'")]
    UnknownCommand(String),

    #[error("Task {0} not found. Please, send the reason first")]
    TaskNotFound(String),

    #[error("Error response from peer: {0}")]
    PeerError(String),

    #[error("Transfer checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch { expected: String, found: String },

    #[error("Transfer timed out after {0:?} without receiving a chunk")]
    TransferTimeout(std::time::Duration),

    // --- Sync errors: scoped to one cycle or one file. ---
    #[error("Synchronization permission not granted")]
    PermissionDenied,

    #[error("Received an old agent status file ({0})")]
    StaleAgentInfo(String),

    #[error("client.keys file received in a master node")]
    ClientKeysOnMaster,

    #[error("Agent status file received in a worker node")]
    AgentInfoOnWorker,

    #[error("Error applying file '{path}': {reason}")]
    Apply { path: String, reason: String },

    #[error("Malformed sync bundle: {0}")]
    MalformedBundle(String),

    // --- Dispatch errors: surfaced to the API caller. ---
    #[error("Unknown API function '{0}'")]
    UnknownFunction(String),

    #[error("Agent is not reporting to any node")]
    NoSolverNode,

    #[error("Node '{0}' is not connected")]
    NodeNotConnected(String),

    #[error("Distributed request timed out")]
    RequestTimeout,

    // --- Startup errors. ---
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid cluster-items manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid cluster key: {0}")]
    InvalidKey(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SentraError {
    /// The stable numeric code surfaced through the API layer.
    pub fn code(&self) -> u16 {
        match self {
            SentraError::Io(_) | SentraError::IncompleteData => 3000,
            SentraError::InvalidConfig(_) => 3004,
            SentraError::InvalidManifest(_) => 3005,
            SentraError::ClientKeysOnMaster => 3007,
            SentraError::UnknownCommand(_) => 3008,
            SentraError::Oversize { .. } | SentraError::CommandTooLong(..) => 3009,
            SentraError::BadAuth | SentraError::InvalidKey(_) => 3010,
            SentraError::AgentInfoOnWorker => 3011,
            SentraError::StaleAgentInfo(_) => 3012,
            SentraError::Apply { .. } | SentraError::ChecksumMismatch { .. } => 3013,
            SentraError::TaskNotFound(_) => 3014,
            SentraError::TransferTimeout(_) => 3015,
            SentraError::PermissionDenied => 3016,
            SentraError::NoSolverNode => 3017,
            SentraError::TransportClosed
            | SentraError::PeerError(_)
            | SentraError::NodeNotConnected(_)
            | SentraError::HandshakeRejected(_) => 3018,
            SentraError::UnknownFunction(_) => 3019,
            SentraError::RequestTimeout => 3020,
            SentraError::MalformedBundle(_) => 3021,
            SentraError::Internal(_) => 1000,
        }
    }

    /// Whether the error must tear down the whole session instead of being
    /// answered on a single exchange.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SentraError::Io(_)
                | SentraError::BadAuth
                | SentraError::Oversize { .. }
                | SentraError::TransportClosed
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for SentraError {
    fn clone(&self) -> Self {
        match self {
            SentraError::Io(e) => SentraError::Io(Arc::clone(e)),
            SentraError::IncompleteData => SentraError::IncompleteData,
            SentraError::BadAuth => SentraError::BadAuth,
            SentraError::Oversize { got, max } => SentraError::Oversize {
                got: *got,
                max: *max,
            },
            SentraError::TransportClosed => SentraError::TransportClosed,
            SentraError::CommandTooLong(a, b) => SentraError::CommandTooLong(*a, *b),
            SentraError::UnknownCommand(s) => SentraError::UnknownCommand(s.clone()),
            SentraError::TaskNotFound(s) => SentraError::TaskNotFound(s.clone()),
            SentraError::PeerError(s) => SentraError::PeerError(s.clone()),
            SentraError::ChecksumMismatch { expected, found } => SentraError::ChecksumMismatch {
                expected: expected.clone(),
                found: found.clone(),
            },
            SentraError::TransferTimeout(d) => SentraError::TransferTimeout(*d),
            SentraError::PermissionDenied => SentraError::PermissionDenied,
            SentraError::StaleAgentInfo(s) => SentraError::StaleAgentInfo(s.clone()),
            SentraError::ClientKeysOnMaster => SentraError::ClientKeysOnMaster,
            SentraError::AgentInfoOnWorker => SentraError::AgentInfoOnWorker,
            SentraError::Apply { path, reason } => SentraError::Apply {
                path: path.clone(),
                reason: reason.clone(),
            },
            SentraError::MalformedBundle(s) => SentraError::MalformedBundle(s.clone()),
            SentraError::UnknownFunction(s) => SentraError::UnknownFunction(s.clone()),
            SentraError::NoSolverNode => SentraError::NoSolverNode,
            SentraError::NodeNotConnected(s) => SentraError::NodeNotConnected(s.clone()),
            SentraError::RequestTimeout => SentraError::RequestTimeout,
            SentraError::InvalidConfig(s) => SentraError::InvalidConfig(s.clone()),
            SentraError::InvalidManifest(s) => SentraError::InvalidManifest(s.clone()),
            SentraError::InvalidKey(s) => SentraError::InvalidKey(s.clone()),
            SentraError::HandshakeRejected(s) => SentraError::HandshakeRejected(s.clone()),
            SentraError::Internal(s) => SentraError::Internal(s.clone()),
        }
    }
}

impl PartialEq for SentraError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SentraError::Io(e1), SentraError::Io(e2)) => e1.to_string() == e2.to_string(),
            (SentraError::UnknownCommand(a), SentraError::UnknownCommand(b)) => a == b,
            (SentraError::TaskNotFound(a), SentraError::TaskNotFound(b)) => a == b,
            (SentraError::PeerError(a), SentraError::PeerError(b)) => a == b,
            (SentraError::StaleAgentInfo(a), SentraError::StaleAgentInfo(b)) => a == b,
            (SentraError::UnknownFunction(a), SentraError::UnknownFunction(b)) => a == b,
            (SentraError::NodeNotConnected(a), SentraError::NodeNotConnected(b)) => a == b,
            (SentraError::HandshakeRejected(a), SentraError::HandshakeRejected(b)) => a == b,
            (SentraError::Internal(a), SentraError::Internal(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for SentraError {
    fn from(e: std::io::Error) -> Self {
        SentraError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for SentraError {
    fn from(e: serde_json::Error) -> Self {
        SentraError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<std::str::Utf8Error> for SentraError {
    fn from(e: std::str::Utf8Error) -> Self {
        SentraError::Internal(format!("Invalid UTF-8 in payload: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for SentraError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        SentraError::Internal(format!("Invalid UTF-8 in payload: {e}"))
    }
}

impl From<bincode::error::EncodeError> for SentraError {
    fn from(e: bincode::error::EncodeError) -> Self {
        SentraError::MalformedBundle(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for SentraError {
    fn from(e: bincode::error::DecodeError) -> Self {
        SentraError::MalformedBundle(e.to_string())
    }
}
