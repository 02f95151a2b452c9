use thiserror::Error;

use crate::retry::Retryable;

/// Errors from the Leonardo REST API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },

    #[error("Request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        source: reqwest::Error,
    },

    #[error("Malformed response from {endpoint}: {source}")]
    Parse {
        endpoint: String,
        source: serde_json::Error,
    },

    #[error("Identity response contained no user details")]
    MissingUser,

    #[error("Invalid API base URL '{0}'")]
    InvalidBaseUrl(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

impl Retryable for ApiError {
    /// Rate limiting, server errors and transport failures are transient.
    /// Auth failures and schema mismatches will not fix themselves.
    fn is_retryable(&self) -> bool {
        match self {
            ApiError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            ApiError::Http { .. } => true,
            ApiError::Parse { .. }
            | ApiError::MissingUser
            | ApiError::InvalidBaseUrl(_)
            | ApiError::Client(_) => false,
        }
    }
}
