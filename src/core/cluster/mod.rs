// src/core/cluster/mod.rs

//! Node identity, the version handshake, and the master/worker runtimes.

pub mod master;
pub mod worker;

use crate::core::SentraError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The static role of a node, fixed by configuration.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeType {
    Master,
    Worker,
}

/// A product version. Two nodes are compatible when major and minor match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProductVersion {
    pub fn current() -> Self {
        env!("CARGO_PKG_VERSION")
            .parse()
            .unwrap_or(Self {
                major: 0,
                minor: 0,
                patch: 0,
            })
    }

    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl FromStr for ProductVersion {
    type Err = SentraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |name: &str| -> Result<u32, SentraError> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| SentraError::HandshakeRejected(format!("bad version {name} in '{s}'")))
        };
        Ok(Self {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch").unwrap_or(0),
        })
    }
}

impl std::fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What a node announces about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    pub node_name: String,
    pub node_type: NodeType,
    pub cluster_name: String,
    pub version: ProductVersion,
}

impl NodeIdentity {
    /// The payload of the `hello` frame:
    /// `"<name> <cluster> <type> <version>"`.
    pub fn hello_payload(&self) -> String {
        format!(
            "{} {} {} {}",
            self.node_name, self.cluster_name, self.node_type, self.version
        )
    }

    /// Parses a `hello` payload back into an identity.
    pub fn from_hello(payload: &str) -> Result<Self, SentraError> {
        let parts: Vec<&str> = payload.split(' ').collect();
        if parts.len() != 4 {
            return Err(SentraError::HandshakeRejected(format!(
                "malformed hello '{payload}'"
            )));
        }
        let node_type = parts[2]
            .parse::<NodeType>()
            .map_err(|_| SentraError::HandshakeRejected(format!("unknown node type '{}'", parts[2])))?;
        Ok(Self {
            node_name: parts[0].to_string(),
            cluster_name: parts[1].to_string(),
            node_type,
            version: parts[3].parse()?,
        })
    }
}
