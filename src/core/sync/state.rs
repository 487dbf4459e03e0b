// src/core/sync/state.rs

//! Master-side synchronization state, one record per connected worker.
//!
//! The three `*_free` booleans are the permission gate: at most one in-flight
//! sync of each category per worker. The gate is cleared atomically when
//! permission is granted and restored at cycle end regardless of outcome.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::json;

/// The three synchronization categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SyncCategory {
    #[strum(serialize = "integrity")]
    Integrity,
    #[strum(serialize = "agent-info")]
    AgentInfo,
    #[strum(serialize = "extra-valid")]
    ExtraValid,
}

fn serialize_date<S: Serializer>(
    date: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match date {
        Some(d) => serializer.serialize_str(&d.to_rfc3339()),
        None => serializer.serialize_str("n/a"),
    }
}

/// Totals of the last completed integrity classification.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct IntegrityTotals {
    pub missing: usize,
    pub shared: usize,
    pub extra: usize,
    pub extra_valid: usize,
}

/// Start/end timestamps and totals of the last integrity cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    #[serde(serialize_with = "serialize_date")]
    pub date_start_master: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_date")]
    pub date_end_master: Option<DateTime<Utc>>,
    pub total_files: IntegrityTotals,
}

/// Start/end timestamps and a flat file count, for the agent-info and
/// agent-groups cycles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileCycleReport {
    #[serde(serialize_with = "serialize_date")]
    pub date_start_master: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_date")]
    pub date_end_master: Option<DateTime<Utc>>,
    pub total_files: usize,
}

/// Per-worker synchronization state held by the master.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub sync_integrity_free: bool,
    pub sync_agentinfo_free: bool,
    pub sync_extravalid_free: bool,
    pub last_sync_integrity: IntegrityReport,
    pub last_sync_agentinfo: FileCycleReport,
    pub last_sync_agentgroups: FileCycleReport,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            sync_integrity_free: true,
            sync_agentinfo_free: true,
            sync_extravalid_free: true,
            last_sync_integrity: IntegrityReport::default(),
            last_sync_agentinfo: FileCycleReport::default(),
            last_sync_agentgroups: FileCycleReport::default(),
        }
    }
}

impl SyncStatus {
    fn flag_mut(&mut self, category: SyncCategory) -> &mut bool {
        match category {
            SyncCategory::Integrity => &mut self.sync_integrity_free,
            SyncCategory::AgentInfo => &mut self.sync_agentinfo_free,
            SyncCategory::ExtraValid => &mut self.sync_extravalid_free,
        }
    }

    /// Grants permission iff the category is free, clearing the flag in the
    /// same step. Also stamps the cycle start time on a grant.
    pub fn try_acquire(&mut self, category: SyncCategory) -> bool {
        let flag = self.flag_mut(category);
        if !*flag {
            return false;
        }
        *flag = false;
        let now = Some(Utc::now());
        match category {
            SyncCategory::Integrity => self.last_sync_integrity.date_start_master = now,
            SyncCategory::AgentInfo => self.last_sync_agentinfo.date_start_master = now,
            SyncCategory::ExtraValid => self.last_sync_agentgroups.date_start_master = now,
        }
        true
    }

    /// Restores the gate at cycle end, success or failure.
    pub fn release(&mut self, category: SyncCategory) {
        *self.flag_mut(category) = true;
    }

    pub fn is_free(&self, category: SyncCategory) -> bool {
        match category {
            SyncCategory::Integrity => self.sync_integrity_free,
            SyncCategory::AgentInfo => self.sync_agentinfo_free,
            SyncCategory::ExtraValid => self.sync_extravalid_free,
        }
    }

    /// Records the end of a completed integrity cycle.
    pub fn finish_integrity(&mut self, totals: IntegrityTotals) {
        self.last_sync_integrity.date_end_master = Some(Utc::now());
        self.last_sync_integrity.total_files = totals;
    }

    /// Records the end of a completed agent-info cycle.
    pub fn finish_agent_info(&mut self, total: usize) {
        self.last_sync_agentinfo.date_end_master = Some(Utc::now());
        self.last_sync_agentinfo.total_files = total;
    }

    /// Records the end of a completed agent-groups (extra-valid) cycle.
    pub fn finish_agent_groups(&mut self, total: usize) {
        self.last_sync_agentgroups.date_end_master = Some(Utc::now());
        self.last_sync_agentgroups.total_files = total;
    }

    /// The JSON view surfaced by `get_health`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}
