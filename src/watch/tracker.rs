// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Periodic sampler that turns playback positions into one watched report.
//!
//! Each session runs on its own task and owns nothing but its
//! [`WatchSession`]. The report is dispatched on a separate task so a slow
//! server never delays sampling, and its outcome is only logged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::policy::WatchedThreshold;
use super::reporter::WatchReporter;
use super::session::{PlaybackSample, SessionState, WatchSession};
use crate::config::WatchConfig;
use crate::types::asset_id_from_source;

/// Where the tracker reads the current playback position.
///
/// Returns `None` while the player has nothing to report (e.g. still
/// buffering the first frame).
pub trait PositionSource: Send + Sync {
    fn sample(&self) -> Option<PlaybackSample>;
}

/// Maps a playback source (URL or local path) to the asset id it presents.
pub trait SourceResolver: Send + Sync {
    fn asset_id_for_source(&self, source: &str) -> Option<String>;
}

/// Starts watch sessions that share one reporter and one policy.
#[derive(Clone)]
pub struct WatchProgressTracker {
    reporter: Arc<dyn WatchReporter>,
    threshold: WatchedThreshold,
    interval: Duration,
    resolver: Option<Arc<dyn SourceResolver>>,
}

impl WatchProgressTracker {
    pub fn new(reporter: Arc<dyn WatchReporter>, threshold: WatchedThreshold, interval: Duration) -> Self {
        Self {
            reporter,
            threshold,
            // tokio intervals panic on zero
            interval: interval.max(Duration::from_millis(1)),
            resolver: None,
        }
    }

    /// Resolve sources through `resolver` instead of by file name, so local
    /// files stored under hashed names still report their asset id.
    pub fn with_resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn from_config(config: &WatchConfig, reporter: Arc<dyn WatchReporter>) -> Self {
        Self::new(reporter, WatchedThreshold::from(config), config.sample_interval())
    }

    /// Start sampling for `asset_id`. Must be called inside a Tokio runtime.
    pub fn begin(&self, asset_id: impl Into<String>, positions: Arc<dyn PositionSource>) -> WatchSessionHandle {
        self.spawn(WatchSession::new(asset_id, self.threshold), positions)
    }

    /// Start sampling for whatever `source` (URL or local path) is playing.
    /// `None` if no asset id can be derived from it.
    pub fn begin_for_source(&self, source: &str, positions: Arc<dyn PositionSource>) -> Option<WatchSessionHandle> {
        let asset_id = match &self.resolver {
            Some(resolver) => resolver.asset_id_for_source(source),
            None => asset_id_from_source(source),
        }?;
        Some(self.begin(asset_id, positions))
    }

    fn spawn(&self, session: WatchSession, positions: Arc<dyn PositionSource>) -> WatchSessionHandle {
        let asset_id = session.asset_id().to_string();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Armed);

        debug!(asset_id = %asset_id, interval_ms = self.interval.as_millis() as u64, "Watch session started");
        let task = tokio::spawn(run_sampler(
            session,
            positions,
            Arc::clone(&self.reporter),
            self.interval,
            shutdown_rx,
            state_tx,
        ));

        WatchSessionHandle {
            asset_id,
            shutdown: Some(shutdown_tx),
            state: state_rx,
            task: Some(task),
        }
    }
}

/// Owner of a running watch session. Dropping it stops the sampler.
pub struct WatchSessionHandle {
    asset_id: String,
    shutdown: Option<oneshot::Sender<()>>,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<()>>,
}

impl WatchSessionHandle {
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.state() == SessionState::Triggered
    }

    /// Stop sampling and wait for the sampler task to exit.
    pub async fn end(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(asset_id = %self.asset_id, "Watch sampler ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for WatchSessionHandle {
    fn drop(&mut self) {
        // The closed oneshot wakes the sampler; abort covers a sampler that
        // is never polled again.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_sampler(
    mut session: WatchSession,
    positions: Arc<dyn PositionSource>,
    reporter: Arc<dyn WatchReporter>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
    state: watch::Sender<SessionState>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!(asset_id = session.asset_id(), "Watch session ended");
                break;
            }
            _ = ticker.tick() => {
                let Some(sample) = positions.sample() else { continue };
                if let Some(asset_id) = session.observe(sample) {
                    let asset_id = asset_id.to_string();
                    state.send_replace(SessionState::Triggered);
                    info!(asset_id = %asset_id, position = sample.position, duration = sample.duration, "Watched threshold reached");
                    dispatch_report(Arc::clone(&reporter), asset_id);
                    // Triggered is terminal.
                    break;
                }
            }
        }
    }
}

fn dispatch_report(reporter: Arc<dyn WatchReporter>, asset_id: String) {
    tokio::spawn(async move {
        match reporter.report_watched(&asset_id).await {
            Ok(()) => info!(asset_id = %asset_id, "Reported as watched"),
            Err(e) => warn!(asset_id = %asset_id, "Watched report failed: {:#}", e),
        }
    });
}
