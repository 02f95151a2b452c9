use clap::{Args, Parser, Subcommand};

use crate::api::DEFAULT_API_BASE;
use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "gensync",
    version,
    about = "Mirror your Leonardo AI generations to a local directory"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch new generations and download missing images (default)
    Sync,

    /// Show checkpoint counts
    Status {
        /// List every asset that failed to download
        #[arg(long)]
        failed: bool,
    },

    /// Check that every generation marked downloaded has its files on disk
    Verify,

    /// Re-queue generations with failed assets, then sync
    RetryFailed,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Leonardo API key.
    /// Prefer the LEONARDO_API_KEY environment variable: flags are visible
    /// in process listings.
    #[arg(long, env = "LEONARDO_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Base directory for the checkpoint and downloads
    #[arg(long, env = "LEONARDO_DOWNLOAD_DIR", default_value = ".", global = true)]
    pub download_dir: String,

    /// Move the existing checkpoint aside and start from scratch
    #[arg(long, global = true)]
    pub rebuild: bool,

    /// Echo progress and recoverable errors (forces debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Account name that locates the checkpoint; lets `status` and `verify`
    /// run without an identity lookup
    #[arg(long, global = true)]
    pub username: Option<String>,

    /// Read another account's generations instead of the key owner's
    #[arg(long, global = true)]
    pub user_id: Option<String>,

    /// Generations requested per page
    #[arg(long, default_value_t = 50, global = true)]
    pub page_size: usize,

    /// Pause between page requests, in milliseconds
    #[arg(long, default_value_t = 60, global = true)]
    pub request_delay_ms: u64,

    /// Number of concurrent downloads
    #[arg(long, default_value_t = 1, global = true)]
    pub threads_num: u16,

    /// Max retries per request or download (0 = no retries)
    #[arg(long, default_value_t = 2, global = true)]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 5, global = true)]
    pub retry_delay: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "error", global = true)]
    pub log_level: LogLevel,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,

    /// List what would be downloaded without downloading it
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Run continuously, waiting N seconds between runs
    #[arg(long, global = true)]
    pub watch_with_interval: Option<u64>,

    /// Leonardo REST API base URL
    #[arg(long, default_value = DEFAULT_API_BASE, global = true)]
    pub api_base_url: String,
}

impl Cli {
    pub fn effective_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["gensync"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_no_subcommand_means_sync() {
        let cli = parse(&["--api-key", "k"]);
        assert_eq!(cli.effective_command(), Command::Sync);
        assert_eq!(cli.global.page_size, 50);
        assert_eq!(cli.global.request_delay_ms, 60);
        assert_eq!(cli.global.threads_num, 1);
        assert_eq!(cli.global.max_retries, 2);
        assert_eq!(cli.global.retry_delay, 5);
        assert_eq!(cli.global.log_level, LogLevel::Error);
        assert_eq!(cli.global.api_base_url, DEFAULT_API_BASE);
        assert!(!cli.global.rebuild);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["status", "--failed", "--download-dir", "/data"]);
        assert_eq!(cli.effective_command(), Command::Status { failed: true });
        assert_eq!(cli.global.download_dir, "/data");
        assert_eq!(cli.global.username, None);
    }

    #[test]
    fn test_retry_failed_subcommand() {
        let cli = parse(&["retry-failed", "--threads-num", "4", "--verbose"]);
        assert_eq!(cli.effective_command(), Command::RetryFailed);
        assert_eq!(cli.global.threads_num, 4);
        assert!(cli.global.verbose);
    }

    #[test]
    fn test_watch_interval_and_log_level() {
        let cli = parse(&["--watch-with-interval", "3600", "--log-level", "warn"]);
        assert_eq!(cli.global.watch_with_interval, Some(3600));
        assert_eq!(cli.global.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        assert!(Cli::try_parse_from(["gensync", "--log-level", "trace"]).is_err());
    }
}
