// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tubeoffline - Offline asset coordinator library
//!
//! Keep videos from a self-hosted archive available without a network, and
//! tell the server when you have watched them.
//!
//! **Catalog** -> **Background transfer** -> **Verified local store** -> **Playback** -> **Watched report**
//!
//! # Core Modules
//!
//! - [`download`] - Background downloads, the asset store and the coordinator
//! - [`watch`] - Playback sampling and the one-shot watched report
//! - [`types`] - Catalog videos and asset-id derivation
//! - [`config`] - Settings file and directory layout
//! - [`persist`] - Locked, atomic JSON state files
//! - [`error`] - Error taxonomy and formatting utilities

pub mod config;
pub mod download;
pub mod error;
pub mod locks;
pub mod persist;
pub mod types;
pub mod watch;

// Re-export commonly used types
pub use config::{load_config, save_config, OfflineConfig, WatchConfig};
pub use error::OfflineError;
pub use types::{asset_id_from_source, Video};

pub use download::{
    AssetStore, CoordinatorEvent, DownloadCoordinator, DownloadStatus, HttpTransport, OfflineSnapshot,
    Transport, TransferEvent, TransferHandle,
};
pub use watch::{
    HttpWatchReporter, PlaybackSample, PositionSource, SourceResolver, WatchProgressTracker, WatchReporter,
    WatchSessionHandle, WatchedThreshold,
};
