// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the offline asset coordinator.
//!
//! Precondition violations (`AlreadyDownloaded`, `AlreadyInProgress`,
//! `NotInProgress`, `NotFound`) are expected races between what the caller
//! saw and what the coordinator holds. They are returned to the caller and
//! never logged as failures. `IoFailure` and `TransportFailure` are real
//! faults: they are logged and surfaced to observers, never fatal.

use std::fmt;

/// Errors returned by coordinator, store and transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineError {
    /// No record and no file exist for the asset id.
    NotFound(String),
    /// `start` was called for an asset that is already stored locally.
    AlreadyDownloaded(String),
    /// `start` was called while a transfer for the asset is running.
    AlreadyInProgress(String),
    /// `cancel` was called for an asset with no running transfer.
    NotInProgress(String),
    /// The video has no usable id or source URL.
    InvalidSource(String),
    /// A filesystem move or delete failed.
    IoFailure(String),
    /// The transfer failed or was interrupted by the network or OS.
    TransportFailure(String),
}

impl OfflineError {
    /// Returns true for expected precondition races rather than faults.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            OfflineError::NotFound(_)
                | OfflineError::AlreadyDownloaded(_)
                | OfflineError::AlreadyInProgress(_)
                | OfflineError::NotInProgress(_)
        )
    }
}

impl fmt::Display for OfflineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "No offline copy of {}", id),
            Self::AlreadyDownloaded(id) => write!(f, "{} is already downloaded", id),
            Self::AlreadyInProgress(id) => write!(f, "{} is already downloading", id),
            Self::NotInProgress(id) => write!(f, "{} is not downloading", id),
            Self::InvalidSource(msg) => write!(f, "Invalid video source: {}", msg),
            Self::IoFailure(msg) => write!(f, "File operation failed: {}", msg),
            Self::TransportFailure(msg) => write!(f, "Transfer failed: {}", msg),
        }
    }
}

impl std::error::Error for OfflineError {}

impl From<std::io::Error> for OfflineError {
    fn from(err: std::io::Error) -> Self {
        OfflineError::IoFailure(err.to_string())
    }
}

/// Formats an error message with title, causes and fixes for CLI output.
///
/// ```
/// use tubeoffline::error::format_error;
///
/// let msg = format_error(
///     "Download failed",
///     &["Server unreachable"],
///     &["Check the server: tubeoffline config show"],
/// );
/// assert!(msg.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}
