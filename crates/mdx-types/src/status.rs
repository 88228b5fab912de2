//! Observable state of the master data pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the master data sync state machine.
///
/// `Uninitialized → Loading → {Ready, Missing, Stale} → Syncing → {Ready, Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Uninitialized,
    Loading,
    Ready,
    Missing,
    Stale,
    Syncing,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Uninitialized => "uninitialized",
            SyncState::Loading => "loading",
            SyncState::Ready => "ready",
            SyncState::Missing => "missing",
            SyncState::Stale => "stale",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Counters collected over one completed sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub files_listed: usize,
    pub files_loaded: usize,
    pub files_failed: usize,
    pub rows_parsed: u64,
    pub rows_rejected: u64,
    pub records_indexed: usize,
    pub duplicates_overwritten: usize,
    /// Newest last-modified value reported by any source file
    pub source_last_modified: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// Snapshot of the pipeline state handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub is_loading: bool,
    pub is_missing: bool,
    pub is_stale: bool,
    pub is_syncing: bool,
    pub error: Option<String>,
    /// Build timestamp of the index currently served
    pub last_modified: Option<DateTime<Utc>>,
    pub symbol_count: usize,
    pub last_report: Option<SyncReport>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Uninitialized,
            is_loading: true,
            is_missing: false,
            is_stale: false,
            is_syncing: false,
            error: None,
            last_modified: None,
            symbol_count: 0,
            last_report: None,
        }
    }
}

impl SyncStatus {
    pub fn begin_loading(&mut self) {
        self.state = SyncState::Loading;
        self.is_loading = true;
    }

    /// Persisted index was found and is fresh.
    pub fn loaded(&mut self, built_at: DateTime<Utc>, symbol_count: usize) {
        self.state = SyncState::Ready;
        self.is_loading = false;
        self.is_missing = false;
        self.is_stale = false;
        self.error = None;
        self.last_modified = Some(built_at);
        self.symbol_count = symbol_count;
    }

    pub fn mark_missing(&mut self) {
        self.state = SyncState::Missing;
        self.is_missing = true;
        self.is_stale = false;
    }

    pub fn mark_stale(&mut self) {
        self.state = SyncState::Stale;
        self.is_stale = true;
    }

    pub fn begin_sync(&mut self) {
        self.state = SyncState::Syncing;
        self.is_syncing = true;
        self.error = None;
    }

    pub fn sync_succeeded(&mut self, built_at: DateTime<Utc>, report: SyncReport) {
        self.state = SyncState::Ready;
        self.is_loading = false;
        self.is_missing = false;
        self.is_stale = false;
        self.is_syncing = false;
        self.error = None;
        self.last_modified = Some(built_at);
        self.symbol_count = report.records_indexed;
        self.last_report = Some(report);
    }

    /// Missing/stale flags are left as they were; the previous index (if any) stays live.
    pub fn sync_failed(&mut self, message: String) {
        self.state = SyncState::Error;
        self.is_loading = false;
        self.is_syncing = false;
        self.error = Some(message);
    }

    /// Store and in-memory index were dropped on request.
    pub fn cleared(&mut self) {
        self.state = SyncState::Missing;
        self.is_loading = false;
        self.is_missing = true;
        self.is_stale = false;
        self.is_syncing = false;
        self.error = None;
        self.last_modified = None;
        self.symbol_count = 0;
    }
}
