// src/core/sync/bundle.rs

//! The compressed bundle format used by the sync engine, plus the merged
//! container format for per-agent group files.
//!
//! A bundle is a bincode-encoded structure compressed with zstd. Worker
//! uploads carry an index (and, for agent-status and extra-valid cycles, the
//! file bodies); the master's integrity reply carries the classification
//! plus the bodies the worker is missing.

use crate::core::SentraError;
use crate::core::sync::scanner::{Classified, FileMeta};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// zstd level for sync bundles. Index-only bundles are tiny; content bundles
/// are dominated by rule files which compress well at low levels.
const BUNDLE_COMPRESSION_LEVEL: i32 = 3;

/// A worker→master upload: the scan index plus optional file bodies.
#[derive(Debug, Clone, Default, bincode::Encode, bincode::Decode)]
pub struct SyncBundle {
    pub node_name: String,
    pub index: BTreeMap<String, FileMeta>,
    /// relpath → content. Empty for the metadata-only integrity upload.
    pub files: BTreeMap<String, Vec<u8>>,
}

/// A master→worker integrity reply: the four-way classification plus the
/// bodies of every missing and shared file.
#[derive(Debug, Clone, Default, bincode::Encode, bincode::Decode)]
pub struct IntegrityReply {
    pub classified: Classified,
    pub files: BTreeMap<String, Vec<u8>>,
}

/// Encodes and compresses any bundle structure.
pub fn compress<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, SentraError> {
    let encoded = bincode::encode_to_vec(value, bincode::config::standard())?;
    zstd::encode_all(encoded.as_slice(), BUNDLE_COMPRESSION_LEVEL)
        .map_err(|e| SentraError::MalformedBundle(e.to_string()))
}

/// Decompresses and decodes a bundle structure.
pub fn decompress<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, SentraError> {
    let decoded = zstd::decode_all(bytes).map_err(|e| SentraError::MalformedBundle(e.to_string()))?;
    let (value, _) = bincode::decode_from_slice(&decoded, bincode::config::standard())?;
    Ok(value)
}

/// Writes compressed bundle bytes to the staging area
/// `queue/cluster/<node>/<label>.bundle` and returns the path. The staged
/// file is what the chunked sender streams; callers remove it afterwards.
pub fn stage(root: &Path, node_name: &str, label: &str, bytes: &[u8]) -> Result<PathBuf, SentraError> {
    let dir = root.join("queue/cluster").join(node_name);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{label}.bundle"));
    let mut file = std::fs::File::create(&path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(path)
}

/// Reads the bodies of every file in `index` from disk, skipping entries
/// that vanished since the scan.
pub fn read_bodies(
    root: &Path,
    index: &BTreeMap<String, FileMeta>,
) -> BTreeMap<String, Vec<u8>> {
    let mut bodies = BTreeMap::new();
    for relpath in index.keys() {
        let path = root.join(relpath.trim_start_matches('/'));
        if let Ok(content) = std::fs::read(&path) {
            bodies.insert(relpath.clone(), content);
        }
    }
    bodies
}

// --- Merged container format ---
//
// Per-agent group files are tiny; shipping thousands of them through the
// chunked protocol one by one would drown the link in round-trips. They are
// merged into one container of the form, repeated per entry:
//
//   "<size> <name> <mtime>\n" ++ <size content bytes>

/// Merges the given group files (relative paths) into one container under
/// `queue/cluster/<node>/agent-groups.merged`. Returns the entry count and
/// the container's relative path; zero entries stage nothing.
pub fn merge_group_files(
    root: &Path,
    node_name: &str,
    files: &[String],
) -> Result<(usize, String), SentraError> {
    let rel = format!("/queue/cluster/{node_name}/agent-groups.merged");
    let dest = root.join(rel.trim_start_matches('/'));
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut out = Vec::new();
    let mut count = 0usize;
    for relpath in files {
        let path = root.join(relpath.trim_start_matches('/'));
        let Ok(content) = std::fs::read(&path) else {
            continue;
        };
        let mtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let name = relpath
            .rsplit('/')
            .next()
            .unwrap_or(relpath.as_str())
            .to_string();
        out.extend_from_slice(format!("{} {} {}\n", content.len(), name, mtime).as_bytes());
        out.extend_from_slice(&content);
        count += 1;
    }

    if count == 0 {
        return Ok((0, rel));
    }
    std::fs::write(&dest, &out)?;
    Ok((count, rel))
}

/// Splits a merged container back into `(name, content, mtime)` entries.
pub fn unmerge_group_files(data: &[u8]) -> Result<Vec<(String, Vec<u8>, i64)>, SentraError> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;

    while cursor < data.len() {
        let line_end = data[cursor..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| SentraError::MalformedBundle("truncated merged header".into()))?;
        let header = std::str::from_utf8(&data[cursor..cursor + line_end])?;
        let mut parts = header.splitn(3, ' ');
        let size: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| SentraError::MalformedBundle("bad merged entry size".into()))?;
        let name = parts
            .next()
            .ok_or_else(|| SentraError::MalformedBundle("missing merged entry name".into()))?
            .to_string();
        let mtime: i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        cursor += line_end + 1;
        if cursor + size > data.len() {
            return Err(SentraError::MalformedBundle(format!(
                "merged entry '{name}' truncated"
            )));
        }
        entries.push((name, data[cursor..cursor + size].to_vec(), mtime));
        cursor += size;
    }

    Ok(entries)
}
