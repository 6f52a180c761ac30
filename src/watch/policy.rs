// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Watched-threshold policy.
//!
//! A video counts as watched once the remaining time drops to
//! `max(duration * fraction, min_remaining_secs)`. With the defaults (10%,
//! 30 s) anything longer than five minutes triggers 30 s before the end and
//! shorter videos trigger in their last 10%.

use crate::config::WatchConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchedThreshold {
    pub fraction: f64,
    pub min_remaining_secs: f64,
}

impl Default for WatchedThreshold {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for WatchedThreshold {
    fn from(config: &WatchConfig) -> Self {
        Self {
            fraction: config.threshold_fraction,
            min_remaining_secs: config.min_remaining_secs,
        }
    }
}

impl WatchedThreshold {
    /// Remaining seconds at or below which a video of `duration` is watched.
    pub fn window(&self, duration: f64) -> f64 {
        (duration * self.fraction).max(self.min_remaining_secs)
    }

    /// Apply the policy to one position sample. Samples without a finite,
    /// positive duration never trigger.
    pub fn should_trigger(&self, position: f64, duration: f64) -> bool {
        if !duration.is_finite() || duration <= 0.0 || !position.is_finite() {
            return false;
        }
        duration - position <= self.window(duration)
    }
}
