//! Download executor: materializes manifest entries into a directory.
//!
//! Files already on disk are skipped, so re-running over the same entries
//! is safe. Each missing file is fetched into `{filename}.part` by the
//! primary transport, then by the fallback if the primary gives up, and is
//! only renamed to its final name once the whole body is on disk.

pub mod error;
pub mod file;

use std::collections::HashSet;
use std::fs::FileTimes;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime};
use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::manifest::AssetEntry;
use crate::retry::RetryConfig;

pub use error::DownloadError;
pub use file::{BufferedFetcher, Fetcher, StreamingFetcher};

/// Subset of application config consumed by the executor.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub concurrency: usize,
    pub dry_run: bool,
    pub show_progress: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            dry_run: false,
            show_progress: false,
        }
    }
}

/// An entry neither transport could fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAsset {
    pub filename: String,
    pub url: String,
    pub error: String,
}

/// What one executor run did with its entries.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: usize,
    /// How many of `downloaded` needed the fallback transport.
    pub via_fallback: usize,
    pub skipped: usize,
    pub failed: Vec<FailedAsset>,
    /// Missing files never tried because of shutdown or dry run.
    pub not_attempted: Vec<String>,
}

enum Outcome {
    Downloaded { via_fallback: bool },
    Failed(FailedAsset),
}

pub struct DownloadExecutor {
    primary: Arc<dyn Fetcher>,
    fallback: Arc<dyn Fetcher>,
    options: DownloadOptions,
}

impl DownloadExecutor {
    pub fn new(
        primary: Arc<dyn Fetcher>,
        fallback: Arc<dyn Fetcher>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            primary,
            fallback,
            options,
        }
    }

    /// Executor over the two HTTP transports.
    pub fn with_http(retry: RetryConfig, options: DownloadOptions) -> Result<Self, DownloadError> {
        Ok(Self::new(
            Arc::new(StreamingFetcher::new(retry)?),
            Arc::new(BufferedFetcher::new()?),
            options,
        ))
    }

    /// Download every entry of `entries` missing from `directory`.
    ///
    /// Per-entry failures are collected in the report, never returned.
    /// Only failing to create `directory` is an error.
    pub async fn run(
        &self,
        entries: &[AssetEntry],
        directory: &Path,
        shutdown_token: &CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        let started = Instant::now();
        tokio::fs::create_dir_all(directory).await?;

        let mut report = DownloadReport::default();
        let mut seen = HashSet::new();
        let mut missing: Vec<&AssetEntry> = Vec::new();

        for entry in entries {
            if !seen.insert(entry.filename.as_str()) {
                tracing::debug!("Duplicate manifest entry {}, ignoring", entry.filename);
                continue;
            }
            let dest = directory.join(&entry.filename);
            if matches!(tokio::fs::try_exists(&dest).await, Ok(true)) {
                tracing::debug!("{} already exists", dest.display());
                report.skipped += 1;
            } else {
                missing.push(entry);
            }
        }

        if self.options.dry_run {
            for entry in &missing {
                tracing::info!(
                    "[DRY RUN] Would download {}",
                    directory.join(&entry.filename).display()
                );
            }
            report.not_attempted = missing.iter().map(|e| e.filename.clone()).collect();
            return Ok(report);
        }

        let pb = create_progress_bar(self.options.show_progress, missing.len() as u64);
        let mut attempted: HashSet<&str> = HashSet::new();

        let results = stream::iter(missing.iter().copied())
            .take_while(|_| std::future::ready(!shutdown_token.is_cancelled()))
            .map(|entry| async move { (entry, self.fetch_one(entry, directory).await) })
            .buffer_unordered(self.options.concurrency.max(1));
        tokio::pin!(results);

        while let Some((entry, outcome)) = results.next().await {
            attempted.insert(entry.filename.as_str());
            pb.set_message(entry.filename.clone());
            match outcome {
                Outcome::Downloaded { via_fallback } => {
                    report.downloaded += 1;
                    if via_fallback {
                        report.via_fallback += 1;
                    }
                }
                Outcome::Failed(failed) => {
                    pb.suspend(|| {
                        tracing::error!("Download failed: {}: {}", failed.filename, failed.error)
                    });
                    report.failed.push(failed);
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        report.not_attempted = missing
            .iter()
            .filter(|e| !attempted.contains(e.filename.as_str()))
            .map(|e| e.filename.clone())
            .collect();
        if !report.not_attempted.is_empty() {
            tracing::warn!(
                "Shutdown requested, {} downloads not started",
                report.not_attempted.len()
            );
        }

        if report.downloaded > 0 || !report.failed.is_empty() {
            tracing::info!("── Download summary ──");
            tracing::info!(
                "  {} downloaded ({} via fallback), {} failed, {} already present",
                report.downloaded,
                report.via_fallback,
                report.failed.len(),
                report.skipped
            );
            tracing::info!("  elapsed: {}", format_duration(started.elapsed()));
        }

        Ok(report)
    }

    async fn fetch_one(&self, entry: &AssetEntry, directory: &Path) -> Outcome {
        let dest = directory.join(&entry.filename);
        let part = part_path(&dest);
        tracing::debug!(url = %entry.url, "Downloading {}", dest.display());

        let primary_err = match fetch_into(self.primary.as_ref(), &entry.url, &part, &dest).await {
            Ok(()) => {
                stamp_mtime(&dest, &entry.created_at).await;
                return Outcome::Downloaded {
                    via_fallback: false,
                };
            }
            Err(e) => e,
        };

        tracing::warn!(
            "{} download of {} failed ({}), retrying with {}",
            self.primary.name(),
            entry.filename,
            primary_err,
            self.fallback.name()
        );

        match fetch_into(self.fallback.as_ref(), &entry.url, &part, &dest).await {
            Ok(()) => {
                stamp_mtime(&dest, &entry.created_at).await;
                Outcome::Downloaded { via_fallback: true }
            }
            Err(fallback_err) => Outcome::Failed(FailedAsset {
                filename: entry.filename.clone(),
                url: entry.url.clone(),
                error: format!(
                    "{}: {}; {}: {}",
                    self.primary.name(),
                    primary_err,
                    self.fallback.name(),
                    fallback_err
                ),
            }),
        }
    }
}

/// Fetch into `part` and move it to `dest`. `part` never outlives a failure.
async fn fetch_into(
    fetcher: &dyn Fetcher,
    url: &str,
    part: &Path,
    dest: &Path,
) -> Result<(), DownloadError> {
    let result = match fetcher.fetch(url, part).await {
        Ok(_) => tokio::fs::rename(part, dest).await.map_err(DownloadError::from),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(part).await;
    }
    result
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

async fn stamp_mtime(path: &Path, created_at: &str) {
    let Some(ts) = parse_created_at(created_at) else {
        tracing::debug!("Unparseable created_at {created_at:?}, leaving mtime alone");
        return;
    };
    let mtime_path = path.to_path_buf();
    match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, ts)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Could not set mtime on {}: {}", path.display(), e),
        Err(e) => tracing::warn!("mtime task failed for {}: {}", path.display(), e),
    }
}

/// Unix timestamp of an API `createdAt` value. Accepts RFC 3339 and the
/// same layout without an offset (read as UTC).
fn parse_created_at(created_at: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(created_at) {
        return Some(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(created_at, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

/// Hidden unless progress was requested and stdout is a TTY.
fn create_progress_bar(show: bool, total: u64) -> ProgressBar {
    if !show || total == 0 || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Set modification and access time. Pre-1970 timestamps are clamped to
/// the epoch where the platform cannot represent them.
fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)
}
