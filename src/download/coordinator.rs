// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download coordinator: the control surface for offline assets.
//!
//! All mutations of the asset store and the transfer registry happen under
//! one write lock, whether they come from a caller (`start`, `cancel`,
//! `delete`) or from the transport's event stream. Transport events are
//! drained by a single task in arrival order, so for one transfer a
//! `Finished` or `Failed` is never applied before the progress events queued
//! ahead of it.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use reqwest::Url;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::asset_store::AssetStore;
use super::registry::{TransferRegistry, TransferState};
use super::transport::Transport;
use super::types::{
    CoordinatorEvent, DownloadStatus, OfflineSnapshot, TransferEvent, TransferHandle, TransferRequest,
    TransferStatus,
};
use crate::error::OfflineError;
use crate::locks::{resilient_read, resilient_write};
use crate::types::{asset_id_from_source, Video};
use crate::watch::SourceResolver;

/// Capacity of the observer broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct CoordinatorState {
    store: AssetStore,
    registry: TransferRegistry,
}

/// Coordinates background downloads into the local asset store.
///
/// Cheap to clone; clones share state. Construct one per application and
/// hand it to whatever needs it.
#[derive(Clone)]
pub struct DownloadCoordinator {
    state: Arc<RwLock<CoordinatorState>>,
    transport: Arc<dyn Transport>,
    base_url: String,
    snapshot_tx: Arc<watch::Sender<OfflineSnapshot>>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
}

impl DownloadCoordinator {
    /// Build a coordinator and reconcile it with the outside world.
    ///
    /// Live transfers reported by the transport are re-associated with their
    /// assets (or cancelled if the asset is already stored), then the store's
    /// id list is checked against the filesystem.
    pub fn start_up(store: AssetStore, transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        let mut store = store;
        let mut registry = TransferRegistry::new();

        let orphans = registry.reconcile_on_startup(transport.live_transfers(), &store, transport.as_ref());
        let dropped = store.reconcile();
        if !orphans.is_empty() || !dropped.is_empty() {
            info!(
                orphaned_transfers = orphans.len(),
                missing_files = dropped.len(),
                "Startup reconciliation changed offline state"
            );
        }

        let coordinator = Self::assemble(store, registry, transport, base_url.into());
        for handle in orphans {
            coordinator.notify(CoordinatorEvent::OrphanCancelled {
                asset_id: handle.asset_id,
            });
        }
        coordinator
    }

    fn assemble(
        store: AssetStore,
        registry: TransferRegistry,
        transport: Arc<dyn Transport>,
        base_url: String,
    ) -> Self {
        let state = CoordinatorState { store, registry };
        let (snapshot_tx, _) = watch::channel(snapshot_of(&state));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            state: Arc::new(RwLock::new(state)),
            transport,
            base_url,
            snapshot_tx: Arc::new(snapshot_tx),
            events_tx,
        }
    }

    /// Drain transport events on a background task until the sender closes.
    ///
    /// Each event is applied on the blocking pool, one at a time: a commit
    /// may copy a whole video across filesystems and persisting waits on file
    /// locks, neither of which may stall a runtime worker.
    pub fn spawn_event_loop(&self, mut events: mpsc::UnboundedReceiver<TransferEvent>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let worker = coordinator.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || worker.handle_event(event)).await {
                    warn!("Transfer event handler panicked: {}", e);
                }
            }
            debug!("Transfer event stream closed");
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Offline status of one asset. A stored asset always reports
    /// `Downloaded`, even if a transfer entry lingers.
    pub fn status(&self, id: &str) -> DownloadStatus {
        let state = resilient_read(&self.state);
        if state.store.is_present(id) {
            return DownloadStatus::Downloaded;
        }
        match state.registry.get(id) {
            Some(entry) if entry.status != TransferStatus::Cancelled => DownloadStatus::Downloading {
                progress: entry.progress,
            },
            _ => DownloadStatus::NotDownloaded,
        }
    }

    /// Path of the stored file, if it still exists.
    pub fn locate(&self, id: &str) -> Option<PathBuf> {
        resilient_read(&self.state).store.locate(id)
    }

    pub fn active_transfers(&self) -> Vec<TransferState> {
        let state = resilient_read(&self.state);
        let mut transfers: Vec<_> = state
            .registry
            .iter()
            .filter(|t| t.status != TransferStatus::Cancelled)
            .cloned()
            .collect();
        transfers.sort_by(|a, b| a.handle.asset_id.cmp(&b.handle.asset_id));
        transfers
    }

    /// The subset of `videos` available offline.
    pub fn downloaded_videos(&self, videos: &[Video]) -> Vec<Video> {
        let state = resilient_read(&self.state);
        videos
            .iter()
            .filter(|v| state.store.is_present(&v.id))
            .cloned()
            .collect()
    }

    /// Published offline state, updated after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<OfflineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Completion, failure and cancellation notifications.
    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events_tx.subscribe()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Start a background download of `video`.
    pub fn start(&self, video: &Video) -> Result<TransferHandle, OfflineError> {
        let id = video.id.trim();
        let mut state = resilient_write(&self.state);

        if state.store.is_present(id) {
            return Err(OfflineError::AlreadyDownloaded(id.to_string()));
        }
        if state.registry.get(id).is_some() {
            return Err(OfflineError::AlreadyInProgress(id.to_string()));
        }
        let url = video.resolve_source(&self.base_url)?;

        // Submitted under the lock so no event for this handle can be applied
        // before it is registered.
        let handle = self
            .transport
            .submit(TransferRequest {
                asset_id: id.to_string(),
                url,
                title: video.title.clone(),
            })
            .inspect_err(|e| warn!(asset_id = id, "Transport rejected transfer: {}", e))?;

        state.registry.begin(handle.clone());
        self.publish(&state);
        drop(state);

        info!(asset_id = id, task = handle.task_id, title = %video.title, "Download started");
        self.notify(CoordinatorEvent::Started {
            asset_id: id.to_string(),
        });
        Ok(handle)
    }

    /// Cancel a running download. Nothing it wrote is kept.
    pub fn cancel(&self, id: &str) -> Result<(), OfflineError> {
        let mut state = resilient_write(&self.state);
        let handle = state
            .registry
            .mark_cancelled(id)
            .ok_or_else(|| OfflineError::NotInProgress(id.to_string()))?;

        self.transport.cancel(&handle);
        state.registry.end(id);
        self.publish(&state);
        drop(state);

        info!(asset_id = id, task = handle.task_id, "Download cancelled");
        self.notify(CoordinatorEvent::Cancelled {
            asset_id: id.to_string(),
        });
        Ok(())
    }

    /// Delete the stored copy of an asset.
    pub fn delete(&self, id: &str) -> Result<(), OfflineError> {
        let mut state = resilient_write(&self.state);
        if let Err(e) = state.store.remove(id) {
            if !e.is_precondition() {
                warn!(asset_id = id, "Delete failed: {}", e);
            }
            return Err(e);
        }
        self.publish(&state);
        drop(state);

        info!(asset_id = id, "Offline copy deleted");
        self.notify(CoordinatorEvent::Deleted {
            asset_id: id.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    /// Apply one transport event. Called by the event loop; hosts that drive
    /// their own loop may call it directly, one event at a time.
    pub fn handle_event(&self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                handle,
                bytes_written,
                bytes_expected,
            } => self.on_progress(&handle, bytes_written, bytes_expected),
            TransferEvent::Finished { handle, temp_path } => self.on_finished(&handle, temp_path),
            TransferEvent::Failed { handle, error } => self.on_failed(&handle, error),
        }
    }

    fn on_progress(&self, handle: &TransferHandle, bytes_written: u64, bytes_expected: Option<u64>) {
        let mut state = resilient_write(&self.state);
        if !state.registry.owns(handle) {
            debug!(asset_id = %handle.asset_id, task = handle.task_id, "Progress for settled transfer ignored");
            return;
        }

        match bytes_expected.filter(|&total| total > 0) {
            Some(total) => {
                let fraction = bytes_written as f64 / total as f64;
                if state.registry.update_progress(&handle.asset_id, fraction) {
                    self.publish(&state);
                }
            }
            None => {
                // Size unknown: stay indeterminate.
                state.registry.mark_active(&handle.asset_id);
            }
        }
    }

    fn on_finished(&self, handle: &TransferHandle, temp_path: PathBuf) {
        let id = handle.asset_id.as_str();
        let mut state = resilient_write(&self.state);

        if !state.registry.owns(handle) {
            // Cancelled (or superseded) before completion was applied.
            debug!(asset_id = id, task = handle.task_id, "Discarding finished file of settled transfer");
            discard_temp(&temp_path);
            self.transport.acknowledge(handle);
            return;
        }

        let committed = match state.store.ensure_storage_dir() {
            Ok(()) => state.store.commit(id, &temp_path),
            Err(e) => Err(e),
        };
        if committed.is_err() {
            discard_temp(&temp_path);
        }
        state.registry.end(id);
        self.transport.acknowledge(handle);
        self.publish(&state);
        drop(state);

        match committed {
            Ok(path) => {
                info!(asset_id = id, path = ?path, "Download completed");
                self.notify(CoordinatorEvent::Completed {
                    asset_id: id.to_string(),
                    path,
                    at: Utc::now(),
                });
            }
            Err(error) => {
                warn!(asset_id = id, "Commit failed, discarded transfer: {}", error);
                self.notify(CoordinatorEvent::CommitFailed {
                    asset_id: id.to_string(),
                    error,
                });
            }
        }
    }

    fn on_failed(&self, handle: &TransferHandle, error: String) {
        let id = handle.asset_id.as_str();
        let mut state = resilient_write(&self.state);

        self.transport.acknowledge(handle);
        if state.registry.owns(handle) {
            state.registry.end(id);
            self.publish(&state);
            drop(state);

            warn!(asset_id = id, task = handle.task_id, "Download failed: {}", error);
            self.notify(CoordinatorEvent::Failed {
                asset_id: id.to_string(),
                error: OfflineError::TransportFailure(error),
            });
        } else {
            drop(state);
            debug!(asset_id = id, task = handle.task_id, "Failure of settled transfer ignored: {}", error);
        }
    }

    fn publish(&self, state: &CoordinatorState) {
        self.snapshot_tx.send_replace(snapshot_of(state));
    }

    fn notify(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

impl SourceResolver for DownloadCoordinator {
    /// Stored files resolve through the store; other sources by file name.
    fn asset_id_for_source(&self, source: &str) -> Option<String> {
        let local = match Url::parse(source) {
            Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
            Ok(_) => None,
            Err(_) => Some(PathBuf::from(source)),
        };
        local
            .and_then(|path| resilient_read(&self.state).store.id_for_path(&path))
            .or_else(|| asset_id_from_source(source))
    }
}

fn snapshot_of(state: &CoordinatorState) -> OfflineSnapshot {
    OfflineSnapshot {
        downloaded: state.store.ids().cloned().collect(),
        progress: state
            .registry
            .iter()
            .filter(|t| t.status != TransferStatus::Cancelled && !state.store.is_present(&t.handle.asset_id))
            .map(|t| (t.handle.asset_id.clone(), t.progress))
            .collect(),
    }
}

fn discard_temp(path: &std::path::Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove transfer file {:?}: {}", path, e);
        }
    }
}
