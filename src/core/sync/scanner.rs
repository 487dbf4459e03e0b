// src/core/sync/scanner.rs

//! The integrity scanner: walks the manifest-declared filesystem roots,
//! computes per-file metadata, and classifies the differences between a
//! worker's index and the master's.

use crate::core::SentraError;
use crate::core::cluster::NodeType;
use crate::core::sync::manifest::{ClusterItems, SourceKind, WriteMode};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use walkdir::WalkDir;

/// Files whose mtime is older than this are considered already synchronized
/// on workers and dropped from their scans. Masters never drop.
const SYNCED_CUTOFF_SECS: i64 = 30 * 60;

/// Scanner output for one file.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct FileMeta {
    /// Hex MD5 of the content; empty when the scan skipped digests.
    pub digest: String,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    pub umask: u32,
    pub write_mode: WriteMode,
    /// Set when the entry is a merged container of per-agent files.
    pub merged: bool,
    pub merge_type: Option<String>,
    /// The manifest key that governed this file.
    pub cluster_item_key: String,
}

/// The four-way partition of a worker index against the master's.
#[derive(
    Debug, Clone, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Classified {
    /// Absent on the worker; master sends content.
    pub missing: BTreeMap<String, FileMeta>,
    /// Present on both with differing digests; master sends its copy.
    pub shared: BTreeMap<String, FileMeta>,
    /// Present only on the worker; worker deletes.
    pub extra: Vec<String>,
    /// Worker-owned content the master must collect and merge.
    pub extra_valid: Vec<String>,
}

impl Classified {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.shared.is_empty()
            && self.extra.is_empty()
            && self.extra_valid.is_empty()
    }

    pub fn totals(&self) -> (usize, usize, usize, usize) {
        (
            self.missing.len(),
            self.shared.len(),
            self.extra.len(),
            self.extra_valid.len(),
        )
    }
}

/// Walks every manifest entry owned by `wanted` (or by all node types) under
/// `root` and returns the index `relpath → FileMeta`. Relative paths carry a
/// leading slash and use the manifest key style (`/etc/rules/base.xml`).
pub fn scan_files(
    root: &Path,
    manifest: &ClusterItems,
    wanted: SourceKind,
    node_type: NodeType,
    with_digest: bool,
) -> Result<BTreeMap<String, FileMeta>, SentraError> {
    let mut index = BTreeMap::new();
    let now = unix_now();

    for (key, spec) in &manifest.files {
        if spec.source != wanted && spec.source != SourceKind::All {
            continue;
        }
        let dir = root.join(key.trim_start_matches('/'));
        if !dir.is_dir() {
            continue;
        }

        let max_depth = if spec.recursive { usize::MAX } else { 1 };
        let walker = WalkDir::new(&dir)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !manifest.is_excluded(name))
                    .unwrap_or(false)
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Skipping unreadable entry under {}: {}", key, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let basename = entry.file_name().to_string_lossy();
            if spec.files[0] != "all" && !spec.files.iter().any(|f| f == basename.as_ref()) {
                continue;
            }

            let relpath = match entry.path().strip_prefix(root) {
                Ok(p) => format!("/{}", p.to_string_lossy()),
                Err(_) => continue,
            };
            match file_meta(entry.path(), key, spec.umask, spec.write_mode, with_digest) {
                Ok(meta) => {
                    // Workers treat old files as already synchronized.
                    if node_type == NodeType::Worker && now - meta.mtime > SYNCED_CUTOFF_SECS {
                        continue;
                    }
                    index.insert(relpath, meta);
                }
                Err(e) => {
                    debug!("Could not stat '{}': {}", relpath, e);
                }
            }
        }
    }

    Ok(index)
}

/// Classifies a worker's index against the master's into
/// `{missing, shared, extra, extra_valid}`. Every path of either index lands
/// in at most one bucket; identical files land in none.
pub fn classify(
    master_index: &BTreeMap<String, FileMeta>,
    worker_index: &BTreeMap<String, FileMeta>,
    manifest: &ClusterItems,
) -> Classified {
    let mut out = Classified::default();

    for (relpath, master_meta) in master_index {
        match worker_index.get(relpath) {
            None => {
                out.missing.insert(relpath.clone(), master_meta.clone());
            }
            Some(worker_meta) => {
                if manifest.is_extra_valid(relpath) {
                    out.extra_valid.push(relpath.clone());
                } else if worker_meta.digest != master_meta.digest {
                    out.shared.insert(relpath.clone(), master_meta.clone());
                }
            }
        }
    }

    for relpath in worker_index.keys() {
        if master_index.contains_key(relpath) {
            continue;
        }
        if manifest.is_extra_valid(relpath) {
            out.extra_valid.push(relpath.clone());
        } else {
            out.extra.push(relpath.clone());
        }
    }

    out
}

fn file_meta(
    path: &Path,
    cluster_item_key: &str,
    umask: u32,
    write_mode: WriteMode,
    with_digest: bool,
) -> Result<FileMeta, SentraError> {
    let stat = std::fs::metadata(path)?;
    let mtime = stat
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let digest = if with_digest {
        content_digest(path)?
    } else {
        String::new()
    };

    Ok(FileMeta {
        digest,
        mtime,
        size: stat.len(),
        umask,
        write_mode,
        merged: false,
        merge_type: None,
        cluster_item_key: cluster_item_key.to_string(),
    })
}

/// Hex MD5 of a file's content, streamed in blocks.
pub fn content_digest(path: &Path) -> Result<String, SentraError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut block = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
