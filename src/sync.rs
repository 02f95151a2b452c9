//! Sync driver: page through the remote collection, merge, checkpoint, then
//! download everything not yet materialized.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::{Credentials, GenerationSource};
use crate::download::{DownloadError, DownloadExecutor, DownloadReport};
use crate::manifest::AssetEntry;
use crate::records::RecordSet;
use crate::state::{CheckpointStore, StateError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Pagination settings for [`sync_all`].
#[derive(Debug, Clone)]
pub struct Paging {
    pub page_size: usize,
    /// Minimum pause between consecutive page requests.
    pub request_delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pages: usize,
    /// Raw records returned across all pages.
    pub fetched: usize,
    pub admitted: usize,
    pub interrupted: bool,
}

/// Walk the collection from offset 0 until a short page, merging each page
/// into `records` and checkpointing after every merge.
///
/// A failed page arrives as an empty page and ends the walk; whatever was
/// merged before it is already saved.
pub async fn sync_all(
    source: &dyn GenerationSource,
    credentials: &Credentials,
    records: &mut RecordSet,
    store: &CheckpointStore,
    paging: &Paging,
    shutdown_token: &CancellationToken,
) -> Result<SyncStats, StateError> {
    let mut stats = SyncStats::default();
    let mut offset = 0usize;

    loop {
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, stopping before offset {offset}");
            stats.interrupted = true;
            break;
        }

        let page = source
            .fetch_page(offset, paging.page_size, credentials)
            .await;
        let page_len = page.len();
        let admitted = records.merge_page(page);
        store.save(records)?;

        stats.pages += 1;
        stats.fetched += page_len;
        stats.admitted += admitted;
        offset += paging.page_size;
        tracing::info!(
            "Progress: {offset} generations scanned, {admitted} new in this page"
        );

        if page_len == 0 || page_len != paging.page_size {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(paging.request_delay) => {}
            _ = shutdown_token.cancelled() => {}
        }
    }

    tracing::debug!(
        pages = stats.pages,
        fetched = stats.fetched,
        admitted = stats.admitted,
        "Pagination finished"
    );
    Ok(stats)
}

/// Run one download batch over every record not yet marked downloaded.
///
/// Every record in the batch is marked downloaded afterwards, even if some
/// of its assets failed (those are listed in `failed_assets`). Records with
/// an entry that was never attempted stay undownloaded.
pub async fn download_incomplete(
    records: &mut RecordSet,
    executor: &DownloadExecutor,
    directory: &Path,
    store: &CheckpointStore,
    shutdown_token: &CancellationToken,
) -> Result<DownloadReport, SyncError> {
    let pending_ids: Vec<String> = records.undownloaded().map(|r| r.id.clone()).collect();
    if pending_ids.is_empty() {
        tracing::info!("All images have been downloaded.");
        return Ok(DownloadReport::default());
    }

    let batch: Vec<AssetEntry> = records
        .undownloaded()
        .flat_map(|r| r.urls.iter().cloned())
        .collect();
    tracing::info!(
        "Downloading up to {} assets from {} generations",
        batch.len(),
        pending_ids.len()
    );

    let report = executor.run(&batch, directory, shutdown_token).await?;

    let not_attempted: HashSet<&str> = report.not_attempted.iter().map(String::as_str).collect();
    let failed: HashSet<&str> = report.failed.iter().map(|f| f.filename.as_str()).collect();

    let mut marked = 0usize;
    for id in &pending_ids {
        let Some(record) = records.get_mut(id) else {
            continue;
        };
        if record
            .urls
            .iter()
            .any(|e| not_attempted.contains(e.filename.as_str()))
        {
            continue;
        }
        record.failed_assets = record
            .urls
            .iter()
            .filter(|e| failed.contains(e.filename.as_str()))
            .map(|e| e.filename.clone())
            .collect();
        record.downloaded = true;
        marked += 1;
    }

    store.save(records)?;
    tracing::debug!(marked, "Marked generations as downloaded");
    Ok(report)
}
