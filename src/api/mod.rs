//! Leonardo REST API: identity lookup and paginated generation listing.

pub mod error;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use crate::records::Record;
use crate::retry::{retry_with_backoff, RetryConfig};

pub use error::ApiError;
pub use types::Identity;

pub const DEFAULT_API_BASE: &str = "https://cloud.leonardo.ai/api/rest/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// API key plus the account whose generations are listed.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub user_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// A paginated listing of generations, newest first.
#[async_trait]
pub trait GenerationSource: Send + Sync {
    /// Fetch up to `limit` generations starting at `offset`.
    ///
    /// Never fails: any error after retries is logged and reported as an
    /// empty page, which ends pagination.
    async fn fetch_page(&self, offset: usize, limit: usize, credentials: &Credentials)
        -> Vec<Record>;
}

pub struct LeonardoClient {
    client: Client,
    base_url: Url,
    retry: RetryConfig,
}

impl LeonardoClient {
    pub fn new(base_url: &str, retry: RetryConfig) -> Result<Self, ApiError> {
        let parsed =
            Url::parse(base_url).map_err(|_| ApiError::InvalidBaseUrl(base_url.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            client,
            base_url: parsed,
            retry,
        })
    }

    /// Resolve the account an API key belongs to. Not retried: a bad key
    /// or an unreachable API is fatal at startup.
    pub async fn fetch_identity(&self, api_key: &str) -> Result<Identity, ApiError> {
        let url = self.endpoint(&["me"]);
        let me: types::MeResponse = self.get_json(url, api_key).await?;
        let identity = Identity::try_from(me)?;
        tracing::debug!(user_id = %identity.user_id, username = %identity.username, "Resolved identity");
        Ok(identity)
    }

    /// One page of generations, retrying transient failures.
    pub async fn try_fetch_page(
        &self,
        offset: usize,
        limit: usize,
        credentials: &Credentials,
    ) -> Result<Vec<Record>, ApiError> {
        let url = self.generations_url(&credentials.user_id, offset, limit);
        let label = format!("generations offset={offset}");
        let page: types::GenerationsResponse = retry_with_backoff(&self.retry, &label, || {
            self.get_json(url.clone(), &credentials.api_key)
        })
        .await?;
        Ok(page.generations.into_iter().map(Record::from).collect())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`: the base URL always has a path.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn generations_url(&self, user_id: &str, offset: usize, limit: usize) -> Url {
        let mut url = self.endpoint(&["generations", "user", user_id]);
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, api_key: &str) -> Result<T, ApiError> {
        let endpoint = url.path().to_string();
        let resp = self
            .client
            .get(url)
            .bearer_auth(api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| ApiError::Http {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
                endpoint,
            });
        }

        let body = resp.bytes().await.map_err(|source| ApiError::Http {
            endpoint: endpoint.clone(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|source| ApiError::Parse { endpoint, source })
    }
}

#[async_trait]
impl GenerationSource for LeonardoClient {
    async fn fetch_page(
        &self,
        offset: usize,
        limit: usize,
        credentials: &Credentials,
    ) -> Vec<Record> {
        match self.try_fetch_page(offset, limit, credentials).await {
            Ok(records) => {
                tracing::debug!(offset, count = records.len(), "Fetched page");
                records
            }
            Err(e) => {
                tracing::warn!(offset, "Error retrieving generations: {e}");
                Vec::new()
            }
        }
    }
}
