// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared types consumed from the catalog and playback layers.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::OfflineError;

/// Ids matching this pattern are used verbatim as storage file names.
static FILENAME_SAFE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("filename pattern is valid")
});

/// A catalog entry, as delivered by the server's video listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    /// Stable asset id shared by downloads and watch tracking.
    #[serde(rename = "youtube_id", alias = "id", default)]
    pub id: String,
    /// Absolute URL, or a path relative to the server base URL.
    #[serde(rename = "media_url", alias = "source_url")]
    pub source_url: String,
    pub title: String,
}

impl Video {
    pub fn new(id: impl Into<String>, source_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            title: title.into(),
        }
    }

    /// Resolve the downloadable URL for this video.
    ///
    /// Relative sources are appended to `base_url`. Fails with
    /// `InvalidSource` when the id is empty, the source is empty, or the
    /// result is not an http(s) URL.
    pub fn resolve_source(&self, base_url: &str) -> Result<Url, OfflineError> {
        if self.id.trim().is_empty() {
            return Err(OfflineError::InvalidSource(format!("'{}' has no asset id", self.title)));
        }

        let source = self.source_url.trim();
        if source.is_empty() {
            return Err(OfflineError::InvalidSource(format!("{} has no source URL", self.id)));
        }

        let url = match Url::parse(source) {
            Ok(url) => url,
            Err(_) => {
                let base = base_url.trim().trim_end_matches('/');
                if base.is_empty() {
                    return Err(OfflineError::InvalidSource(format!(
                        "{} has a relative source '{}' and no server is configured",
                        self.id, source
                    )));
                }
                let joined = if source.starts_with('/') {
                    format!("{}{}", base, source)
                } else {
                    format!("{}/{}", base, source)
                };
                Url::parse(&joined)
                    .map_err(|e| OfflineError::InvalidSource(format!("{}: {} ({})", self.id, joined, e)))?
            }
        };

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(OfflineError::InvalidSource(format!(
                "{}: unsupported scheme '{}'",
                self.id, other
            ))),
        }
    }
}

/// Derive the asset id from a playback source.
///
/// The id is the source's file name up to the first `.`, so both
/// `https://host/media/abc123.mp4` and `/cache/VideoDownloads/abc123.mp4`
/// yield `abc123`.
pub fn asset_id_from_source(source: &str) -> Option<String> {
    let file_name = match Url::parse(source) {
        Ok(url) => url
            .path_segments()
            .and_then(|segments| segments.last().map(str::to_string)),
        Err(_) => Path::new(source)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
    }?;

    let id = file_name.split('.').next().unwrap_or_default();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// File name under which an asset is stored.
///
/// Filename-safe ids are kept readable; anything else is hashed so an id can
/// never name a path outside the storage directory.
pub fn storage_file_name(id: &str, extension: &str) -> String {
    if FILENAME_SAFE_ID.is_match(id) {
        format!("{}.{}", id, extension)
    } else {
        let digest = Sha256::digest(id.as_bytes());
        format!("{}.{}", hex::encode(digest), extension)
    }
}
