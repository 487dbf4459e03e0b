// src/core/sync/manifest.rs

//! The cluster-items manifest: the declarative description of which paths
//! are synchronized between nodes and how received copies are applied.
//!
//! The manifest is a static JSON document read once at startup and immutable
//! thereafter. Implementation code never hard-codes per-directory behavior;
//! this map is authoritative.

use crate::core::SentraError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Which node type owns the files under a manifest entry.
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
pub enum SourceKind {
    Master,
    Worker,
    All,
}

/// How a received file replaces its destination.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WriteMode {
    /// Write to `<dest>.tmp.cluster`, fsync, rename. Readers never observe a
    /// partial file.
    Atomic,
    /// Overwrite in place.
    Inline,
}

/// One synchronized directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSpec {
    pub recursive: bool,
    /// `["all"]` or an explicit list of basenames.
    pub files: Vec<String>,
    pub source: SourceKind,
    #[serde(deserialize_with = "de_umask")]
    pub umask: u32,
    pub write_mode: WriteMode,
    #[serde(default)]
    pub remove_subdirs_if_empty: bool,
    /// Worker-owned content under this key is not an "extra" to delete but
    /// material the master must collect and merge (the extra-valid category).
    #[serde(default)]
    pub extra_valid: bool,
}

/// The full manifest: directory key → spec, plus the flat exclusion set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterItems {
    pub files: BTreeMap<String, ItemSpec>,
    #[serde(default)]
    pub excluded_files: BTreeSet<String>,
}

impl ClusterItems {
    /// Reads and validates the manifest from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, SentraError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SentraError::InvalidManifest(format!("{}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, SentraError> {
        let items: ClusterItems = serde_json::from_str(contents)
            .map_err(|e| SentraError::InvalidManifest(e.to_string()))?;
        items.validate()?;
        Ok(items)
    }

    fn validate(&self) -> Result<(), SentraError> {
        if self.files.is_empty() {
            return Err(SentraError::InvalidManifest(
                "manifest declares no synchronized directories".into(),
            ));
        }
        for (key, spec) in &self.files {
            if !key.starts_with('/') || !key.ends_with('/') {
                return Err(SentraError::InvalidManifest(format!(
                    "directory key '{key}' must start and end with '/'"
                )));
            }
            if spec.files.is_empty() {
                return Err(SentraError::InvalidManifest(format!(
                    "directory key '{key}' declares an empty file list"
                )));
            }
            if spec.umask > 0o777 {
                return Err(SentraError::InvalidManifest(format!(
                    "directory key '{key}' declares umask {:o} out of range",
                    spec.umask
                )));
            }
        }
        Ok(())
    }

    /// A file is excluded when its basename is in the exclusion set or ends
    /// with `~` (editor backups).
    pub fn is_excluded(&self, basename: &str) -> bool {
        basename.ends_with('~') || self.excluded_files.contains(basename)
    }

    /// Resolves the manifest key governing a relative path (leading slash,
    /// e.g. `/etc/rules/base.xml`): the longest directory key that prefixes
    /// it. Falls back to `/etc/` when no key matches, mirroring how unlisted
    /// files have always been treated.
    pub fn key_for(&self, relpath: &str) -> Option<&str> {
        self.files
            .keys()
            .filter(|key| relpath.starts_with(key.as_str()))
            .max_by_key(|key| key.len())
            .map(String::as_str)
            .or_else(|| self.files.contains_key("/etc/").then_some("/etc/"))
    }

    /// The spec governing a relative path, via [`ClusterItems::key_for`].
    pub fn spec_for(&self, relpath: &str) -> Option<(&str, &ItemSpec)> {
        let key = self.key_for(relpath)?;
        self.files.get(key).map(|spec| (key, spec))
    }

    /// Whether worker-side copies under the path's key belong to the
    /// extra-valid category instead of plain extras.
    pub fn is_extra_valid(&self, relpath: &str) -> bool {
        self.spec_for(relpath)
            .map(|(_, spec)| spec.extra_valid)
            .unwrap_or(false)
    }
}

/// Accepts `"0o640"`, `"640"` (octal digits) or a plain JSON integer.
fn de_umask<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => {
            let digits = s.strip_prefix("0o").unwrap_or(&s);
            u32::from_str_radix(digits, 8)
                .map_err(|_| serde::de::Error::custom(format!("invalid octal umask '{s}'")))
        }
    }
}
