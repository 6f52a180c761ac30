// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline downloads for tubeoffline
//!
//! This module keeps videos available without a network connection:
//! - Background transfers that outlive the process (see [`HttpTransport`])
//! - Live progress via a published [`OfflineSnapshot`]
//! - A verified on-disk store of committed files
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐  TransferEvent  ┌─────────────────┐
//! │ DownloadCoordinator  │◀────────────────│ Transport       │
//! │ (single write lock)  │────────────────▶│ (HttpTransport) │
//! └──────┬────────┬──────┘ submit/cancel   └─────────────────┘
//!        │        │
//!        ▼        ▼
//! ┌────────────┐ ┌──────────────────┐
//! │ AssetStore │ │ TransferRegistry │
//! │ (durable)  │ │ (in-memory)      │
//! └────────────┘ └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tubeoffline::config::OfflineConfig;
//! use tubeoffline::download::{AssetStore, DownloadCoordinator, HttpTransport};
//! use tubeoffline::Video;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = OfflineConfig::default();
//! let (events_tx, events_rx) = mpsc::unbounded_channel();
//! let transport = HttpTransport::open(config.staging_dir(), config.api_token(), events_tx)?;
//! let store = AssetStore::load(config.storage_dir(), config.state_path()?, &config.file_extension);
//!
//! let coordinator = DownloadCoordinator::start_up(store, Arc::new(transport), config.base_url());
//! coordinator.spawn_event_loop(events_rx);
//!
//! coordinator.start(&Video::new("abc123", "/media/abc123.mp4", "A video"))?;
//! println!("Status: {:?}", coordinator.status("abc123"));
//! # Ok(())
//! # }
//! ```

pub mod asset_store;
pub mod coordinator;
pub mod registry;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use asset_store::AssetStore;
pub use coordinator::DownloadCoordinator;
pub use registry::{TransferRegistry, TransferState};
pub use transport::{HttpTransport, Transport};
pub use types::{
    CoordinatorEvent, DownloadStatus, OfflineSnapshot, TransferEvent, TransferHandle, TransferRequest,
    TransferStatus,
};
