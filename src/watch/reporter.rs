// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! "Mark watched" calls against the media server.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::OfflineConfig;

/// Request timeout for the watched POST.
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Performs the one-shot watched notification. No queueing, no retries.
#[async_trait]
pub trait WatchReporter: Send + Sync {
    async fn report_watched(&self, asset_id: &str) -> Result<()>;
}

/// Wire body: `{"id":"<id>","is_watched":true}`, fields in this order.
#[derive(Debug, Serialize)]
struct WatchedPayload<'a> {
    id: &'a str,
    is_watched: bool,
}

pub struct HttpWatchReporter {
    client: reqwest::Client,
    endpoint: String,
    api_token: String,
}

impl HttpWatchReporter {
    pub fn new(endpoint: impl Into<String>, api_token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_token: api_token.into().trim().to_string(),
        })
    }

    /// Reporter for the configured server's `/api/watched/` endpoint.
    pub fn from_config(config: &OfflineConfig) -> Result<Self> {
        if config.base_url().is_empty() {
            bail!("No server configured. Run: tubeoffline config set-server <url>");
        }
        Self::new(config.watched_endpoint(), config.api_token())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl WatchReporter for HttpWatchReporter {
    async fn report_watched(&self, asset_id: &str) -> Result<()> {
        let body = serde_json::to_vec(&WatchedPayload {
            id: asset_id,
            is_watched: true,
        })?;

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Token {}", self.api_token))
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Server returned HTTP {} for watched report", status);
        }
        debug!(asset_id, status = status.as_u16(), "Watched status updated");
        Ok(())
    }
}
