//! Deterministic mapping from a generation's assets to local filenames.
//!
//! Every filename embeds the generation id and image id (plus the variation
//! id for derived assets), all of which are unique ids assigned by the API,
//! so two different assets never share a name and the same asset always
//! gets the same name on every run.

use serde::{Deserialize, Serialize};

use crate::records::Record;

/// One remote asset and the local filename it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetEntry {
    pub url: String,
    pub filename: String,
    pub created_at: String,
}

/// Compute the download manifest for a record.
///
/// Emits one entry per image followed by one entry per variation of that
/// image. Variations reuse the parent image's extension.
pub fn build_manifest(record: &Record) -> Vec<AssetEntry> {
    let date = file_compatible_date(&record.created_at);
    let mut entries = Vec::with_capacity(record.asset_count());

    for image in &record.images {
        let ext = url_extension(&image.url);
        let stem = format!("{}_{}_{}", date, record.id, image.id);

        entries.push(AssetEntry {
            url: image.url.clone(),
            filename: with_extension(&stem, ext.as_deref()),
            created_at: record.created_at.clone(),
        });

        for variation in &image.variations {
            let variation_stem = format!(
                "{}_{}_{}",
                stem,
                variation.id,
                variation.transform_type.to_lowercase()
            );
            entries.push(AssetEntry {
                url: variation.url.clone(),
                filename: with_extension(&variation_stem, ext.as_deref()),
                created_at: record.created_at.clone(),
            });
        }
    }

    entries
}

/// Make an API timestamp safe for filenames: `:` becomes `-` and `T`
/// becomes `_`, so `2024-05-01T12:00:00` turns into `2024-05-01_12-00-00`.
pub fn file_compatible_date(created_at: &str) -> String {
    created_at
        .chars()
        .map(|c| match c {
            ':' => '-',
            'T' => '_',
            other => other,
        })
        .collect()
}

/// Extension of the final path segment of `url`, without the dot.
///
/// Query strings and fragments are ignored. Returns `None` when the segment
/// has no `.` or ends with one.
pub fn url_extension(url: &str) -> Option<String> {
    let segment = match url::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => {
            // Not an absolute URL; strip query/fragment by hand.
            let path = url.split(['?', '#']).next().unwrap_or("");
            path.rsplit('/').next().unwrap_or("").to_string()
        }
    };

    let dot = segment.rfind('.')?;
    let ext = &segment[dot + 1..];
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_string())
    }
}

fn with_extension(stem: &str, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => {
            let mut result = String::with_capacity(stem.len() + 1 + ext.len());
            result.push_str(stem);
            result.push('.');
            result.push_str(ext);
            result
        }
        None => stem.to_string(),
    }
}
