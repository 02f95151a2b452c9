//! Transports that fetch one URL into a local file.
//!
//! Two independent implementations: a streaming client that looks like a
//! browser and retries transient failures, and a plain HTTP/1.1 client that
//! pulls the whole body in one call. The executor tries the second when the
//! first gives up.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Some CDNs reject requests without a browser user agent.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const BUFFERED_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Download `url` into `dest`, replacing anything already there.
    /// Returns the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError>;
}

/// Primary transport: streamed body, browser user agent, retried.
pub struct StreamingFetcher {
    client: Client,
    retry: RetryConfig,
}

impl StreamingFetcher {
    pub fn new(retry: RetryConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(DownloadError::Client)?;
        Ok(Self { client, retry })
    }
}

#[async_trait]
impl Fetcher for StreamingFetcher {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let client = &self.client;
        retry_with_backoff(&self.retry, url, move || async move {
            // Each attempt starts from an empty file.
            let _ = fs::remove_file(dest).await;
            attempt_streaming(client, url, dest).await
        })
        .await
    }
}

async fn attempt_streaming(client: &Client, url: &str, dest: &Path) -> Result<u64, DownloadError> {
    let http_err = |source, bytes_written| DownloadError::Http {
        source,
        url: url.to_string(),
        bytes_written,
    };

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| http_err(e, 0))?;

    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)
        .await?;

    let mut bytes_written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| http_err(e, bytes_written))?;
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(bytes_written)
}

/// Fallback transport: separate HTTP/1.1 client, default headers, whole
/// body in one request, single attempt.
pub struct BufferedFetcher {
    client: Client,
}

impl BufferedFetcher {
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .http1_only()
            .timeout(BUFFERED_TIMEOUT)
            .build()
            .map_err(DownloadError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for BufferedFetcher {
    fn name(&self) -> &'static str {
        "buffered"
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| DownloadError::Http {
                source,
                url: url.to_string(),
                bytes_written: 0,
            })?;

        if !response.status().is_success() {
            return Err(DownloadError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await.map_err(|source| DownloadError::Http {
            source,
            url: url.to_string(),
            bytes_written: 0,
        })?;
        fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, TestServer};
    use tempfile::TempDir;

    fn streaming(max_retries: u32) -> StreamingFetcher {
        StreamingFetcher::new(RetryConfig {
            max_retries,
            ..RetryConfig::none()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_streaming_writes_body_with_browser_agent() {
        let server = TestServer::start(vec![Reply::ok(&b"\x89PNG image bytes"[..])]).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.png.part");

        let bytes = streaming(0)
            .fetch(&server.url("/a.png"), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 16);
        assert_eq!(std::fs::read(&dest).unwrap(), b"\x89PNG image bytes");
        assert!(server.requests()[0].contains("user-agent: mozilla/5.0"));
    }

    #[tokio::test]
    async fn test_streaming_retries_server_error() {
        let server = TestServer::start(vec![
            Reply::Status(502, Vec::new()),
            Reply::ok(&b"ok"[..]),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("b.jpg.part");

        streaming(2)
            .fetch(&server.url("/b.jpg"), &dest)
            .await
            .unwrap();
        assert_eq!(server.hits(), 2);
        assert_eq!(std::fs::read(&dest).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_streaming_does_not_retry_not_found() {
        let server = TestServer::start(vec![Reply::Status(404, Vec::new())]).await;
        let dir = TempDir::new().unwrap();

        let err = streaming(3)
            .fetch(&server.url("/gone.jpg"), &dir.path().join("gone.jpg.part"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_streaming_replaces_stale_partial() {
        let server = TestServer::start(vec![Reply::ok(&b"fresh"[..])]).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("c.jpg.part");
        std::fs::write(&dest, b"stale leftover from a crashed run").unwrap();

        streaming(0).fetch(&server.url("/c.jpg"), &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_buffered_writes_body_without_custom_agent() {
        let server = TestServer::start(vec![Reply::ok(&b"whole body"[..])]).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("d.webp.part");

        let bytes = BufferedFetcher::new()
            .unwrap()
            .fetch(&server.url("/d.webp"), &dest)
            .await
            .unwrap();
        assert_eq!(bytes, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"whole body");
        assert!(!server.requests()[0].contains("mozilla"));
    }

    #[tokio::test]
    async fn test_buffered_reports_status() {
        let server = TestServer::start(vec![Reply::Status(403, Vec::new())]).await;
        let dir = TempDir::new().unwrap();
        let err = BufferedFetcher::new()
            .unwrap()
            .fetch(&server.url("/e.png"), &dir.path().join("e.png.part"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 403, .. }));
    }
}
