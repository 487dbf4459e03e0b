// src/core/sync/apply.rs

//! Applies received files to the local tree.
//!
//! Write discipline: `atomic` writes go to `<dest>.tmp.cluster`, are fsynced
//! and renamed over the destination, so readers observe either the old or
//! the new content; `inline` writes overwrite in place. Permissions honor
//! the manifest umask; the source mtime is restored after the write.
//!
//! Two destinations get special guards: `client.keys` may only land on
//! workers (removed agent lines fire the agent-removal hook) and agent
//! status files may only land on masters (older-than-destination records
//! are refused with the stale code so the sender drops them).

use crate::core::SentraError;
use crate::core::cluster::NodeType;
use crate::core::sync::bundle::{IntegrityReply, unmerge_group_files};
use crate::core::sync::manifest::{ClusterItems, WriteMode};
use crate::core::sync::scanner::FileMeta;
use filetime::FileTime;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Mode bits for parent directories created on the apply path.
const DIR_MODE: u32 = 0o750;
/// Base mode the umask is subtracted from for written files.
const FILE_MODE_BASE: u32 = 0o666;

/// One agent record line in `client.keys`: id, name, ip (or `any`/CIDR), key.
static CLIENT_KEYS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{3} \S+ (any|\d+\.\d+\.\d+\.\d+(/\d+)?) \S+$").expect("valid pattern")
});

/// Invoked with the agent id of every record removed by a `client.keys`
/// replacement, so the host can retire the agent.
pub type AgentRemovalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-filetype apply counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyCounters {
    pub updated: usize,
    pub removed: usize,
    pub errors: BTreeMap<&'static str, usize>,
}

impl ApplyCounters {
    fn count_error(&mut self, filetype: &'static str) {
        *self.errors.entry(filetype).or_insert(0) += 1;
    }

    pub fn total_errors(&self) -> usize {
        self.errors.values().sum()
    }
}

/// Writes one received file to its destination. Guards first, then the
/// manifest-declared write mode.
pub fn update_file(
    root: &Path,
    relpath: &str,
    content: &[u8],
    meta: &FileMeta,
    node_type: NodeType,
    hook: Option<&AgentRemovalHook>,
) -> Result<(), SentraError> {
    let dest = root.join(relpath.trim_start_matches('/'));
    let basename = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if basename == "client.keys" {
        match node_type {
            NodeType::Master => {
                warn!("client.keys file received in a master node.");
                return Err(SentraError::ClientKeysOnMaster);
            }
            NodeType::Worker => check_removed_agents(&dest, content, hook),
        }
    }

    if relpath.contains("agent-info") {
        match node_type {
            NodeType::Worker => {
                warn!("Agent status file received in a worker node.");
                return Err(SentraError::AgentInfoOnWorker);
            }
            NodeType::Master => {
                // Refuse records older than what the master already holds.
                if let Ok(stat) = std::fs::metadata(&dest) {
                    let current_mtime = stat
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    if current_mtime > meta.mtime {
                        warn!("Receiving an old agent status file ({basename})");
                        return Err(SentraError::StaleAgentInfo(basename));
                    }
                }
            }
        }
    }

    if let Some(parent) = dest.parent()
        && !parent.exists()
    {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(parent)?;
    }

    let target = match meta.write_mode {
        WriteMode::Atomic => std::path::PathBuf::from(format!("{}.tmp.cluster", dest.display())),
        WriteMode::Inline => dest.clone(),
    };

    let mut file = std::fs::File::create(&target)?;
    std::io::Write::write_all(&mut file, content)?;
    file.set_permissions(std::fs::Permissions::from_mode(FILE_MODE_BASE & !meta.umask))?;
    file.sync_all()?;
    drop(file);

    filetime::set_file_mtime(&target, FileTime::from_unix_time(meta.mtime, 0))?;

    if meta.write_mode == WriteMode::Atomic {
        std::fs::rename(&target, &dest)?;
    }

    Ok(())
}

/// Applies a master integrity reply on a worker: overwrite shared and
/// missing files, unlink extras, prune empty directories where the manifest
/// allows. Individual failures are counted per filetype and the apply
/// continues; the caller logs the counters.
pub fn apply_integrity_reply(
    root: &Path,
    manifest: &ClusterItems,
    reply: &IntegrityReply,
    node_type: NodeType,
    hook: Option<&AgentRemovalHook>,
) -> ApplyCounters {
    let mut counters = ApplyCounters::default();

    for (filetype, files) in [
        ("missing", &reply.classified.missing),
        ("shared", &reply.classified.shared),
    ] {
        debug!("Received {} {} files to update.", files.len(), filetype);
        for (relpath, meta) in files {
            let Some(content) = reply.files.get(relpath) else {
                error!("Reply bundle lists '{relpath}' but carries no content.");
                counters.count_error(filetype);
                continue;
            };
            let result = if meta.merged {
                apply_merged(root, content, meta, node_type, hook).map(|_| ())
            } else {
                update_file(root, relpath, content, meta, node_type, hook)
            };
            match result {
                Ok(()) => counters.updated += 1,
                Err(e) => {
                    error!("Error processing {} file '{}': {}", filetype, relpath, e);
                    counters.count_error(filetype);
                }
            }
        }
    }

    remove_extras(root, manifest, &reply.classified.extra, &mut counters);

    if counters.total_errors() > 0 {
        error!(
            "Found errors applying integrity reply: {:?} ({} files updated, {} removed)",
            counters.errors, counters.updated, counters.removed
        );
    }

    counters
}

/// Splits a merged container and applies each entry under the container's
/// declared manifest key. Returns the number of entries applied.
pub fn apply_merged(
    root: &Path,
    content: &[u8],
    meta: &FileMeta,
    node_type: NodeType,
    hook: Option<&AgentRemovalHook>,
) -> Result<usize, SentraError> {
    let mut applied = 0usize;
    for (name, body, mtime) in unmerge_group_files(content)? {
        let relpath = format!("{}{}", meta.cluster_item_key, name);
        let entry_meta = FileMeta {
            mtime,
            size: body.len() as u64,
            merged: false,
            merge_type: None,
            ..meta.clone()
        };
        update_file(root, &relpath, &body, &entry_meta, node_type, hook)?;
        applied += 1;
    }
    Ok(applied)
}

/// Unlinks extra files, then prunes their parents when the manifest flags
/// the key with `remove_subdirs_if_empty` and nothing (or only excluded
/// files) remains.
fn remove_extras(
    root: &Path,
    manifest: &ClusterItems,
    extras: &[String],
    counters: &mut ApplyCounters,
) {
    for relpath in extras {
        let path = root.join(relpath.trim_start_matches('/'));
        debug!("Removing file '{}'", relpath);
        match std::fs::remove_file(&path) {
            Ok(()) => counters.removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("File '{}' does not exist.", relpath);
            }
            Err(e) => {
                error!("Error removing file '{}': {}", relpath, e);
                counters.count_error("extra");
            }
        }
    }

    let mut parents: BTreeSet<&str> = BTreeSet::new();
    for relpath in extras {
        let prunable = manifest
            .spec_for(relpath)
            .map(|(_, spec)| spec.remove_subdirs_if_empty)
            .unwrap_or(false);
        if prunable && let Some(idx) = relpath.rfind('/') {
            parents.insert(&relpath[..idx]);
        }
    }
    for parent in parents {
        let dir = root.join(parent.trim_start_matches('/'));
        let leftovers = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(_) => continue,
        };
        if leftovers.iter().all(|name| manifest.is_excluded(name)) {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                error!("Error removing directory '{}': {}", parent, e);
                counters.count_error("extra");
            } else {
                info!("Removed empty directory '{}'", parent);
            }
        }
    }
}

/// Applies a worker's agent-status upload on the master: every file is
/// written unconditionally except for the stale-mtime guard. Returns
/// `(applied, stale_or_failed)`.
pub fn apply_agent_info(
    root: &Path,
    files: &BTreeMap<String, Vec<u8>>,
    index: &BTreeMap<String, FileMeta>,
) -> (usize, usize) {
    let mut applied = 0usize;
    let mut failed = 0usize;
    for (relpath, content) in files {
        let Some(meta) = index.get(relpath) else {
            failed += 1;
            continue;
        };
        match update_file(root, relpath, content, meta, NodeType::Master, None) {
            Ok(()) => applied += 1,
            Err(SentraError::StaleAgentInfo(name)) => {
                // Stale entries are dropped, not retried; just count them.
                debug!("Discarded stale agent status file '{}'", name);
                failed += 1;
            }
            Err(e) => {
                error!("Error applying agent status file '{}': {}", relpath, e);
                failed += 1;
            }
        }
    }
    (applied, failed)
}

/// Diffs the incoming `client.keys` against the current one and fires the
/// agent-removal hook for every removed agent record line.
fn check_removed_agents(dest: &Path, new_content: &[u8], hook: Option<&AgentRemovalHook>) {
    let Some(hook) = hook else {
        return;
    };
    let Ok(current) = std::fs::read_to_string(dest) else {
        return;
    };
    let new_text = String::from_utf8_lossy(new_content);
    let new_lines: BTreeSet<&str> = new_text.lines().collect();

    for line in current.lines() {
        if !new_lines.contains(line) && CLIENT_KEYS_LINE.is_match(line) {
            let agent_id = line.split(' ').next().unwrap_or_default();
            info!("Agent {} removed from client.keys", agent_id);
            hook(agent_id);
        }
    }
}
