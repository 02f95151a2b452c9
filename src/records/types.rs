//! Types for the synchronized record set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::{self, AssetEntry};

/// Lifecycle tag reported by the API for a generation.
///
/// Only `Pending` is non-terminal. Unknown tags are kept verbatim so they
/// round-trip through the checkpoint unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GenerationStatus {
    Pending,
    Complete,
    Failed,
    Other(String),
}

impl GenerationStatus {
    /// The wire/database form of the status.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Other(s) => s,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl From<&str> for GenerationStatus {
    fn from(s: &str) -> Self {
        match s {
            "PENDING" => Self::Pending,
            "COMPLETE" => Self::Complete,
            "FAILED" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for GenerationStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PENDING" | "COMPLETE" | "FAILED" => Self::from(s.as_str()),
            _ => Self::Other(s),
        }
    }
}

impl From<GenerationStatus> for String {
    fn from(status: GenerationStatus) -> Self {
        match status {
            GenerationStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A derived asset (upscale, background removal, ...) attached to an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVariation {
    pub id: String,
    pub url: String,
    pub transform_type: String,
}

/// One generated image and its variations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub variations: Vec<ImageVariation>,
}

/// A generation as tracked in the record set and the checkpoint.
///
/// `id`, `created_at` and `images` are fixed once fetched; `urls` is the
/// manifest cached at admission time.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Generation id assigned by the API.
    pub id: String,
    /// Creation timestamp exactly as the API reported it.
    pub created_at: String,
    pub images: Vec<GeneratedImage>,
    /// Cached download manifest (see [`manifest::build_manifest`]).
    pub urls: Vec<AssetEntry>,
    /// Manifest filenames whose most recent download attempt failed.
    pub failed_assets: Vec<String>,
    /// When this record was admitted into the set.
    pub first_seen_at: DateTime<Utc>,
    pub status: GenerationStatus,
    /// Set once a full download pass has run over `urls`.
    pub downloaded: bool,
}

impl Record {
    /// Build a record freshly parsed from the API. It carries no manifest
    /// until it is admitted into a [`RecordSet`](super::RecordSet).
    pub fn new_fetched(
        id: String,
        status: GenerationStatus,
        created_at: String,
        images: Vec<GeneratedImage>,
    ) -> Self {
        Self {
            id,
            created_at,
            images,
            urls: Vec::new(),
            failed_assets: Vec::new(),
            first_seen_at: Utc::now(),
            status,
            downloaded: false,
        }
    }

    /// Reset download state and attach the manifest.
    pub(crate) fn admit(mut self) -> Self {
        self.downloaded = false;
        self.failed_assets.clear();
        self.first_seen_at = Utc::now();
        self.urls = manifest::build_manifest(&self);
        self
    }

    /// Number of image and variation assets this record maps to.
    pub fn asset_count(&self) -> usize {
        self.images.iter().map(|i| 1 + i.variations.len()).sum()
    }
}
