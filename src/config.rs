// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Settings file for the offline coordinator.
//!
//! Stored as JSON at `~/.tubeoffline/config.json`. Missing fields fall back
//! to defaults so older files keep loading.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the per-user config directory under `$HOME`.
const CONFIG_DIR_NAME: &str = ".tubeoffline";

/// Subdirectory of the cache root holding committed media files.
pub const STORAGE_SUBDIR: &str = "VideoDownloads";

/// Subdirectory of the cache root holding in-flight transfers and the journal.
pub const STAGING_SUBDIR: &str = "transfers";

/// Watched-threshold tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Sampling cadence for playback position (milliseconds).
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Fraction of the duration that counts as "the end" for short videos.
    #[serde(default = "default_threshold_fraction")]
    pub threshold_fraction: f64,
    /// Lower bound on the remaining-time window, in seconds.
    #[serde(default = "default_min_remaining_secs")]
    pub min_remaining_secs: f64,
}

fn default_sample_interval_ms() -> u64 {
    500
}

fn default_threshold_fraction() -> f64 {
    0.10
}

fn default_min_remaining_secs() -> f64 {
    30.0
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            threshold_fraction: default_threshold_fraction(),
            min_remaining_secs: default_min_remaining_secs(),
        }
    }
}

impl WatchConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Media server base URL, e.g. `https://archive.example.org`.
    #[serde(default)]
    pub server_url: String,
    /// API token sent as `Authorization: Token <token>`.
    #[serde(default)]
    pub api_token: String,
    /// Cache root override. Defaults to the platform cache dir.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Extension of committed media files.
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    #[serde(default)]
    pub watch: WatchConfig,
}

fn default_file_extension() -> String {
    "mp4".to_string()
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_token: String::new(),
            cache_dir: None,
            file_extension: default_file_extension(),
            watch: WatchConfig::default(),
        }
    }
}

impl OfflineConfig {
    /// Server URL with surrounding whitespace and one trailing slash removed.
    pub fn base_url(&self) -> String {
        let url = self.server_url.trim();
        url.strip_suffix('/').unwrap_or(url).to_string()
    }

    /// Endpoint for the "mark watched" call.
    pub fn watched_endpoint(&self) -> String {
        format!("{}/api/watched/", self.base_url())
    }

    pub fn api_token(&self) -> &str {
        self.api_token.trim()
    }

    /// Cache root: the configured override or `<platform cache>/tubeoffline`.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|c| c.join("tubeoffline"))
                .unwrap_or_else(|| PathBuf::from(".tubeoffline-cache"))
        })
    }

    /// Directory holding committed media files.
    pub fn storage_dir(&self) -> PathBuf {
        self.cache_root().join(STORAGE_SUBDIR)
    }

    /// Directory holding partial transfers and the transfer journal.
    pub fn staging_dir(&self) -> PathBuf {
        self.cache_root().join(STAGING_SUBDIR)
    }

    /// Location of the persisted downloaded-asset list.
    pub fn state_path(&self) -> Result<PathBuf> {
        Ok(config_dir()?.join("downloads.json"))
    }
}

/// `~/.tubeoffline`, created on first use.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(CONFIG_DIR_NAME);
    if !dir.exists() {
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    Ok(dir)
}

pub fn load_config() -> Result<OfflineConfig> {
    let path = config_dir()?.join("config.json");
    if !path.exists() {
        return Ok(OfflineConfig::default());
    }
    let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

pub fn save_config(config: &OfflineConfig) -> Result<()> {
    let path = config_dir()?.join("config.json");
    let content = serde_json::to_string_pretty(config)?;
    fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}
