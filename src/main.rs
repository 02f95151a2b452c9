//! gensync: incremental mirror of a Leonardo AI account.
//!
//! Pages through the account's generations, keeps every one it has seen in a
//! per-account SQLite checkpoint, and downloads each generated image and
//! variation once. Interrupted runs resume from the last checkpoint.

#![warn(clippy::all)]

mod api;
mod cli;
mod config;
mod download;
mod manifest;
mod records;
mod retry;
mod shutdown;
mod state;
mod sync;
mod types;

#[cfg(test)]
mod test_support;

use std::path::Path;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use api::{Credentials, LeonardoClient};
use cli::Command;
use config::{AccountPaths, Config};
use download::DownloadExecutor;
use records::RecordSet;
use state::{CheckpointStore, SyncRunStats};

/// Storage locations for the read-only commands: named from `--username`
/// if given, otherwise from whoever the API key belongs to.
async fn resolve_paths(config: &Config) -> anyhow::Result<AccountPaths> {
    if let Some(username) = &config.username {
        return Ok(config.account_paths(username, None));
    }
    let client = LeonardoClient::new(&config.api_base_url, config.retry())?;
    let identity = client
        .fetch_identity(config.require_api_key()?)
        .await
        .context("Failed to retrieve user info")?;
    Ok(config.account_paths(&identity.username, Some(&identity.user_id)))
}

/// Run the status command.
async fn run_status(config: &Config, show_failed: bool) -> anyhow::Result<()> {
    let paths = resolve_paths(config).await?;

    if !paths.checkpoint.exists() {
        println!("No checkpoint found at {}", paths.checkpoint.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let store = CheckpointStore::open(&paths.checkpoint, false).await?;
    let summary = store.summary()?;

    println!("Checkpoint: {}", store.path().display());
    println!();
    println!("Generations:");
    println!("  Total:        {}", summary.total_records);
    println!("  Downloaded:   {}", summary.downloaded_records);
    println!("  Pending:      {}", summary.pending_records);
    println!("  With failures: {}", summary.records_with_failures);
    println!();
    println!("Assets:");
    println!("  Total:  {}", summary.total_assets);
    println!("  Failed: {}", summary.failed_assets);
    println!();

    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if show_failed && summary.failed_assets > 0 {
        println!();
        println!("Failed assets:");
        let records = store.load()?;
        for record in records.iter().filter(|r| !r.failed_assets.is_empty()) {
            for filename in &record.failed_assets {
                println!("  {} ({})", filename, record.id);
            }
        }
    }

    Ok(())
}

/// Run the verify command.
async fn run_verify(config: &Config) -> anyhow::Result<()> {
    let paths = resolve_paths(config).await?;

    if !paths.checkpoint.exists() {
        println!("No checkpoint found at {}", paths.checkpoint.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let store = CheckpointStore::open(&paths.checkpoint, false).await?;
    let records = store.load()?;
    let (verified, missing) = verify_downloads(&records, &paths.downloads);

    println!();
    println!("Results:");
    println!("  Verified: {}", verified);
    println!("  Missing:  {}", missing);

    if missing > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Count manifest files of downloaded records present and absent under
/// `directory`, printing each absent one.
fn verify_downloads(records: &RecordSet, directory: &Path) -> (usize, usize) {
    let mut verified = 0;
    let mut missing = 0;
    for record in records.iter().filter(|r| r.downloaded) {
        for entry in &record.urls {
            let path = directory.join(&entry.filename);
            if path.exists() {
                verified += 1;
            } else {
                let note = if record.failed_assets.contains(&entry.filename) {
                    " [failed during sync]"
                } else {
                    ""
                };
                println!("MISSING: {} ({}){}", path.display(), record.id, note);
                missing += 1;
            }
        }
    }
    (verified, missing)
}

/// One sync cycle: page, merge, download, snapshot.
#[allow(clippy::too_many_arguments)]
async fn sync_cycle(
    client: &LeonardoClient,
    credentials: &Credentials,
    records: &mut RecordSet,
    store: &CheckpointStore,
    executor: &DownloadExecutor,
    paths: &AccountPaths,
    config: &Config,
    shutdown_token: &CancellationToken,
) -> anyhow::Result<()> {
    let run_id = store.start_sync_run()?;

    let stats = sync::sync_all(
        client,
        credentials,
        records,
        store,
        &config.paging(),
        shutdown_token,
    )
    .await?;
    tracing::info!(
        "Fetched {} generations over {} pages, {} new",
        stats.fetched,
        stats.pages,
        stats.admitted
    );

    let report = sync::download_incomplete(
        records,
        executor,
        &paths.downloads,
        store,
        shutdown_token,
    )
    .await?;

    let snapshot = store.snapshot(Local::now())?;
    tracing::info!("Checkpoint copy written to {}", snapshot.display());

    store.complete_sync_run(
        run_id,
        &SyncRunStats {
            pages: stats.pages,
            fetched: stats.fetched,
            admitted: stats.admitted,
            assets_downloaded: report.downloaded,
            assets_failed: report.failed.len(),
            interrupted: stats.interrupted || shutdown_token.is_cancelled(),
        },
    )?;
    Ok(())
}

/// Run the sync and retry-failed commands.
async fn run_sync(config: &Config, retry_failed: bool) -> anyhow::Result<()> {
    let api_key = config.require_api_key()?;
    let shutdown_token = shutdown::install_signal_handler()?;

    let client = LeonardoClient::new(&config.api_base_url, config.retry())?;
    let identity = client
        .fetch_identity(api_key)
        .await
        .context("Failed to retrieve user info")?;
    tracing::info!(
        "User Info Retrieved: {} ({})",
        identity.username,
        identity.user_id
    );

    let credentials = Credentials {
        api_key: api_key.to_string(),
        user_id: config
            .user_id
            .clone()
            .unwrap_or_else(|| identity.user_id.clone()),
    };
    let paths = config.account_paths(&identity.username, Some(&identity.user_id));

    let store = CheckpointStore::open(&paths.checkpoint, config.rebuild)
        .await
        .with_context(|| format!("Failed to open checkpoint {}", paths.checkpoint.display()))?;
    let mut records = store.load()?;
    if records.is_empty() {
        tracing::info!("Starting a new checkpoint at {}", store.path().display());
    } else {
        tracing::info!(
            "Loaded {} generations from {}",
            records.len(),
            store.path().display()
        );
    }

    if retry_failed {
        let count = records.reset_failed();
        if count > 0 {
            store.save(&records)?;
            tracing::info!(count, "Re-queued generations with failed assets");
        } else {
            tracing::info!("No failed assets to retry");
        }
    }

    let executor = DownloadExecutor::with_http(config.retry(), config.download_options())?;
    tracing::debug!(?config, "Starting sync");

    loop {
        sync_cycle(
            &client,
            &credentials,
            &mut records,
            &store,
            &executor,
            &paths,
            config,
            &shutdown_token,
        )
        .await?;

        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        let Some(interval) = config.watch_with_interval else {
            break;
        };
        tracing::info!("Waiting {} seconds...", interval);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
            _ = shutdown_token.cancelled() => {
                tracing::info!("Shutdown during wait, exiting...");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let command = cli.effective_command();
    let config = Config::from_cli(cli.global)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();

    match command {
        Command::Status { failed } => run_status(&config, failed).await,
        Command::Verify => run_verify(&config).await,
        Command::Sync => run_sync(&config, false).await,
        Command::RetryFailed => run_sync(&config, true).await,
    }
}
