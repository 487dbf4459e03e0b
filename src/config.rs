// src/config.rs

//! Manages daemon configuration: loading, validation, and derived values.

use crate::core::cluster::{NodeIdentity, NodeType, ProductVersion};
use crate::core::protocol::PayloadCipher;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Timer settings for the periodic loops and transfer throttles.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Intervals {
    /// Period of the worker integrity loop.
    #[serde(with = "humantime_serde", default = "default_sync_integrity")]
    pub sync_integrity: Duration,
    /// Period of the worker agent-status loop.
    #[serde(with = "humantime_serde", default = "default_sync_files")]
    pub sync_files: Duration,
    /// Sleep between chunks of a file transfer, yielding the link to other
    /// exchanges.
    #[serde(with = "humantime_serde", default = "default_transfer_send")]
    pub file_transfer_send: Duration,
    /// Sleep between chunks of a string transfer.
    #[serde(with = "humantime_serde", default = "default_transfer_send")]
    pub string_transfer_send: Duration,
    /// Period of the worker keep-alive echo.
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            sync_integrity: default_sync_integrity(),
            sync_files: default_sync_files(),
            file_transfer_send: default_transfer_send(),
            string_transfer_send: default_transfer_send(),
            keep_alive: default_keep_alive(),
        }
    }
}

fn default_sync_integrity() -> Duration {
    Duration::from_secs(15)
}
fn default_sync_files() -> Duration {
    Duration::from_secs(40)
}
fn default_transfer_send() -> Duration {
    Duration::from_millis(100)
}
fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}
fn default_max_time_receiving_file() -> Duration {
    Duration::from_secs(30)
}
fn default_max_time_receiving_string() -> Duration {
    Duration::from_secs(10)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    1516
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("sentra_data")
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    name: String,
    node_name: String,
    node_type: NodeType,
    #[serde(default)]
    key: Option<String>,
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    nodes: Vec<String>,
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    manifest_path: Option<PathBuf>,
    #[serde(default)]
    control_socket: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    interval: Intervals,
    #[serde(with = "humantime_serde", default = "default_max_time_receiving_file")]
    max_time_receiving_file: Duration,
    #[serde(with = "humantime_serde", default = "default_max_time_receiving_string")]
    max_time_receiving_string: Duration,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    request_timeout: Duration,
}

/// The final, validated daemon configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// The cluster name every member must share.
    pub name: String,
    pub node_name: String,
    pub node_type: NodeType,
    /// The 32-character pre-shared payload key; `None` disables encryption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub bind_addr: String,
    pub port: u16,
    /// Master addresses a worker may connect to; the first entry is used.
    pub nodes: Vec<String>,
    /// Installation root all synchronized paths are relative to.
    pub data_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub control_socket: PathBuf,
    pub log_level: String,
    pub interval: Intervals,
    #[serde(with = "humantime_serde")]
    pub max_time_receiving_file: Duration,
    #[serde(with = "humantime_serde")]
    pub max_time_receiving_string: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let manifest_path = raw
            .manifest_path
            .unwrap_or_else(|| raw.data_dir.join("etc/cluster.json"));
        let control_socket = raw
            .control_socket
            .unwrap_or_else(|| raw.data_dir.join("queue/cluster/control.sock"));

        let config = Config {
            name: raw.name,
            node_name: raw.node_name,
            node_type: raw.node_type,
            key: raw.key.filter(|k| !k.is_empty()),
            bind_addr: raw.bind_addr,
            port: raw.port,
            nodes: raw.nodes,
            data_dir: raw.data_dir,
            manifest_path,
            control_socket,
            log_level: raw.log_level,
            interval: raw.interval,
            max_time_receiving_file: raw.max_time_receiving_file,
            max_time_receiving_string: raw.max_time_receiving_string,
            request_timeout: raw.request_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.name.trim().is_empty() {
            return Err(anyhow!("cluster name cannot be empty"));
        }
        if self.node_name.trim().is_empty() {
            return Err(anyhow!("node_name cannot be empty"));
        }
        if self.node_name.contains(' ') || self.name.contains(' ') {
            return Err(anyhow!("node_name and cluster name cannot contain spaces"));
        }
        if let Some(key) = &self.key
            && (key.len() != 32 || !key.is_ascii())
        {
            return Err(anyhow!("key must be exactly 32 ASCII characters"));
        }
        if self.node_type == NodeType::Worker && self.nodes.is_empty() {
            return Err(anyhow!("a worker needs at least one master address in 'nodes'"));
        }
        if self.interval.sync_integrity.is_zero() || self.interval.sync_files.is_zero() {
            return Err(anyhow!("sync intervals cannot be zero"));
        }
        Ok(())
    }

    /// This node's announced identity.
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_name: self.node_name.clone(),
            node_type: self.node_type,
            cluster_name: self.name.clone(),
            version: ProductVersion::current(),
        }
    }

    /// The payload cipher, when a cluster key is configured.
    pub fn cipher(&self) -> Result<Option<PayloadCipher>, crate::core::SentraError> {
        self.key
            .as_deref()
            .map(PayloadCipher::from_key)
            .transpose()
    }
}
