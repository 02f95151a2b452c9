use thiserror::Error;

use crate::retry::Retryable;

/// Typed download errors enabling retry classification.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error {status} downloading {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP error downloading {url} (bytes_so_far={bytes_written}): {source}")]
    Http {
        source: reqwest::Error,
        url: String,
        bytes_written: u64,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Failed to build download client: {0}")]
    Client(reqwest::Error),
}

impl Retryable for DownloadError {
    /// Server-side and transport failures are transient; a 4xx on a CDN URL
    /// or a local disk problem will fail the same way again.
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            DownloadError::Http { .. } => true,
            DownloadError::Disk(_) | DownloadError::Client(_) => false,
        }
    }
}
