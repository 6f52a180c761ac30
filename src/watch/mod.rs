// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Watched tracking for playback sessions
//!
//! While a video plays, a [`WatchProgressTracker`] samples the position on a
//! fixed cadence. The first time the remaining time falls inside the
//! [`WatchedThreshold`] window it sends one report through a
//! [`WatchReporter`] and stops.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tubeoffline::config::OfflineConfig;
//! use tubeoffline::watch::{HttpWatchReporter, PlaybackSample, PositionSource, WatchProgressTracker};
//!
//! struct Player;
//! impl PositionSource for Player {
//!     fn sample(&self) -> Option<PlaybackSample> {
//!         Some(PlaybackSample::new(95.0, 120.0))
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = OfflineConfig::default();
//! let reporter = Arc::new(HttpWatchReporter::from_config(&config)?);
//! let tracker = WatchProgressTracker::from_config(&config.watch, reporter);
//!
//! let session = tracker.begin("abc123", Arc::new(Player));
//! // ... playback ...
//! session.end().await;
//! # Ok(())
//! # }
//! ```

pub mod policy;
pub mod reporter;
pub mod session;
pub mod tracker;

pub use policy::WatchedThreshold;
pub use reporter::{HttpWatchReporter, WatchReporter};
pub use session::{PlaybackSample, SessionState, WatchSession};
pub use tracker::{PositionSource, SourceResolver, WatchProgressTracker, WatchSessionHandle};
