//! Types reported by the checkpoint store.

use chrono::{DateTime, Utc};

/// Counters recorded for one run in the `sync_runs` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRunStats {
    pub pages: usize,
    pub fetched: usize,
    pub admitted: usize,
    pub assets_downloaded: usize,
    pub assets_failed: usize,
    pub interrupted: bool,
}

/// Checkpoint overview for the `status` command.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSummary {
    pub total_records: u64,
    pub downloaded_records: u64,
    pub pending_records: u64,
    pub records_with_failures: u64,
    pub failed_assets: u64,
    pub total_assets: u64,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
}
