use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::GlobalArgs;
use crate::download::DownloadOptions;
use crate::retry::RetryConfig;
use crate::sync::Paging;
use crate::types::LogLevel;

/// Backoff ceiling shared by API requests and downloads.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Application configuration, built once from CLI arguments and environment.
pub struct Config {
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub download_dir: PathBuf,
    pub username: Option<String>,
    pub user_id: Option<String>,

    pub watch_with_interval: Option<u64>,
    pub retry_delay_secs: u64,
    pub request_delay_ms: u64,
    pub page_size: usize,
    pub max_retries: u32,
    pub threads_num: u16,

    pub log_level: LogLevel,

    pub rebuild: bool,
    pub verbose: bool,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("download_dir", &self.download_dir)
            .field("user_id", &self.user_id)
            .field("page_size", &self.page_size)
            .field("threads_num", &self.threads_num)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(args: GlobalArgs) -> anyhow::Result<Self> {
        if args.page_size == 0 {
            anyhow::bail!("--page-size must be at least 1");
        }
        if args.threads_num == 0 {
            anyhow::bail!("--threads-num must be at least 1");
        }
        let api_key = args.api_key.filter(|k| !k.trim().is_empty());

        Ok(Self {
            api_key,
            api_base_url: args.api_base_url,
            download_dir: expand_tilde(&args.download_dir),
            username: args.username,
            user_id: args.user_id,
            watch_with_interval: args.watch_with_interval,
            retry_delay_secs: args.retry_delay,
            request_delay_ms: args.request_delay_ms,
            page_size: args.page_size,
            max_retries: args.max_retries,
            threads_num: args.threads_num,
            log_level: args.log_level,
            rebuild: args.rebuild,
            verbose: args.verbose,
            dry_run: args.dry_run,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn require_api_key(&self) -> anyhow::Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!("An API key is required: pass --api-key or set LEONARDO_API_KEY")
        })
    }

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            LogLevel::Debug.as_filter()
        } else {
            self.log_level.as_filter()
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_delay_secs),
            max_delay: MAX_RETRY_DELAY,
        }
    }

    pub fn paging(&self) -> Paging {
        Paging {
            page_size: self.page_size,
            request_delay: Duration::from_millis(self.request_delay_ms),
        }
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            concurrency: self.threads_num as usize,
            dry_run: self.dry_run,
            show_progress: self.verbose && !self.no_progress_bar,
        }
    }

    /// Name the storage files after the account being read. With
    /// `--user-id` naming someone other than the key owner, the read
    /// account's id is appended so its records and files stay apart from
    /// the owner's. `owner_user_id` is `None` when no identity lookup ran.
    pub fn storage_name(&self, owner_username: &str, owner_user_id: Option<&str>) -> String {
        match self.user_id.as_deref() {
            Some(user_id) if Some(user_id) != owner_user_id => {
                format!("{owner_username}_{user_id}")
            }
            _ => owner_username.to_string(),
        }
    }

    pub fn account_paths(&self, owner_username: &str, owner_user_id: Option<&str>) -> AccountPaths {
        AccountPaths::new(
            &self.download_dir,
            &self.storage_name(owner_username, owner_user_id),
        )
    }
}

/// Per-account storage locations under the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPaths {
    pub checkpoint: PathBuf,
    pub downloads: PathBuf,
}

impl AccountPaths {
    pub fn new(base: &Path, username: &str) -> Self {
        Self {
            checkpoint: base.join(format!("{username}_generations.db")),
            downloads: base.join(format!("{username}_downloads")),
        }
    }
}
