// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by the store, registry, transport and coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::OfflineError;

/// Offline availability of one asset, as seen by the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStatus {
    /// No local copy and no running transfer
    NotDownloaded,
    /// Transfer running; `progress` is `None` while the size is unknown
    Downloading { progress: Option<f64> },
    /// Committed to local storage
    Downloaded,
}

impl DownloadStatus {
    pub fn is_downloading(&self) -> bool {
        matches!(self, DownloadStatus::Downloading { .. })
    }

    /// Get progress percentage (0-100) if known.
    pub fn progress_percent(&self) -> Option<f64> {
        match self {
            DownloadStatus::NotDownloaded => None,
            DownloadStatus::Downloading { progress } => progress.map(|p| p * 100.0),
            DownloadStatus::Downloaded => Some(100.0),
        }
    }
}

/// Lifecycle of an in-memory transfer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Submitted, no bytes reported yet
    Pending,
    /// Bytes are flowing
    Active,
    /// Cancel requested; events for it are ignored
    Cancelled,
}

/// Identifies one transfer attempt.
///
/// The asset id tags the transfer so it can be re-associated after a
/// restart; the task id distinguishes successive attempts for the same asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferHandle {
    pub asset_id: String,
    pub task_id: u64,
}

impl TransferHandle {
    /// Create a handle with a fresh random task id.
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            task_id: rand::random(),
        }
    }
}

/// A request to fetch one asset into staging.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub asset_id: String,
    pub url: Url,
    pub title: String,
}

/// Events delivered by a transport, in submission order per transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Bytes written so far; `bytes_expected` is `None` when unknown
    Progress {
        handle: TransferHandle,
        bytes_written: u64,
        bytes_expected: Option<u64>,
    },
    /// Transfer complete; the file at `temp_path` is ready to commit
    Finished {
        handle: TransferHandle,
        temp_path: PathBuf,
    },
    /// Transfer failed or was interrupted
    Failed { handle: TransferHandle, error: String },
}

/// Notifications for observers (logging, UI toasts).
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Started { asset_id: String },
    Completed { asset_id: String, path: PathBuf, at: DateTime<Utc> },
    Cancelled { asset_id: String },
    Deleted { asset_id: String },
    Failed { asset_id: String, error: OfflineError },
    CommitFailed { asset_id: String, error: OfflineError },
    /// A transfer found live at startup for an asset that was already stored
    OrphanCancelled { asset_id: String },
}

/// Published view of offline state, updated after every mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfflineSnapshot {
    pub downloaded: BTreeSet<String>,
    pub progress: BTreeMap<String, Option<f64>>,
}

impl OfflineSnapshot {
    pub fn status(&self, asset_id: &str) -> DownloadStatus {
        if self.downloaded.contains(asset_id) {
            DownloadStatus::Downloaded
        } else if let Some(progress) = self.progress.get(asset_id) {
            DownloadStatus::Downloading { progress: *progress }
        } else {
            DownloadStatus::NotDownloaded
        }
    }
}
