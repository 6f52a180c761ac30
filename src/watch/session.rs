// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One playback presentation: `Armed -> Triggered`, never back.

use super::policy::WatchedThreshold;

/// A position sample from the player, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSample {
    pub position: f64,
    pub duration: f64,
}

impl PlaybackSample {
    pub fn new(position: f64, duration: f64) -> Self {
        Self { position, duration }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Armed,
    Triggered,
}

#[derive(Debug, Clone)]
pub struct WatchSession {
    asset_id: String,
    threshold: WatchedThreshold,
    state: SessionState,
}

impl WatchSession {
    pub fn new(asset_id: impl Into<String>, threshold: WatchedThreshold) -> Self {
        Self {
            asset_id: asset_id.into(),
            threshold,
            state: SessionState::Armed,
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_triggered(&self) -> bool {
        self.state == SessionState::Triggered
    }

    /// Feed one sample. Returns the asset id the first time the threshold is
    /// crossed, and `None` for every other sample.
    pub fn observe(&mut self, sample: PlaybackSample) -> Option<&str> {
        if self.state == SessionState::Triggered {
            return None;
        }
        if !self.threshold.should_trigger(sample.position, sample.duration) {
            return None;
        }
        self.state = SessionState::Triggered;
        Some(&self.asset_id)
    }
}
