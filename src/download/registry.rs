// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory table of running transfers.
//!
//! Never persisted: after a restart it is rebuilt from the transport's own
//! list of live transfers, which is the source of truth for "still running".

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::asset_store::AssetStore;
use super::transport::Transport;
use super::types::{TransferHandle, TransferStatus};

/// One running transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferState {
    pub handle: TransferHandle,
    /// Fraction in `[0, 1]`, `None` until a sized progress event arrives
    pub progress: Option<f64>,
    pub status: TransferStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: HashMap<String, TransferState>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending transfer.
    ///
    /// At most one transfer per asset: returns false (and changes nothing)
    /// if an entry already exists.
    pub fn begin(&mut self, handle: TransferHandle) -> bool {
        self.insert(handle, TransferStatus::Pending)
    }

    fn insert(&mut self, handle: TransferHandle, status: TransferStatus) -> bool {
        if let Some(existing) = self.transfers.get(&handle.asset_id) {
            warn!(
                asset_id = %handle.asset_id,
                existing_task = existing.handle.task_id,
                rejected_task = handle.task_id,
                "Transfer already registered, ignoring"
            );
            return false;
        }

        self.transfers.insert(
            handle.asset_id.clone(),
            TransferState {
                handle,
                progress: None,
                status,
                started_at: Utc::now(),
            },
        );
        true
    }

    /// Raise the progress fraction. Late events for unknown or cancelled
    /// entries are ignored; progress never moves backwards.
    ///
    /// Returns true if the entry changed.
    pub fn update_progress(&mut self, id: &str, fraction: f64) -> bool {
        let Some(entry) = self.transfers.get_mut(id) else {
            debug!(asset_id = id, "Progress for unknown transfer ignored");
            return false;
        };
        if entry.status == TransferStatus::Cancelled || !fraction.is_finite() {
            return false;
        }

        let fraction = fraction.clamp(0.0, 1.0);
        let next = entry.progress.map_or(fraction, |current| current.max(fraction));
        let changed = entry.progress != Some(next) || entry.status != TransferStatus::Active;
        entry.progress = Some(next);
        entry.status = TransferStatus::Active;
        changed
    }

    /// Mark a transfer as started without a known size.
    pub fn mark_active(&mut self, id: &str) {
        if let Some(entry) = self.transfers.get_mut(id) {
            if entry.status == TransferStatus::Pending {
                entry.status = TransferStatus::Active;
            }
        }
    }

    /// Flag an entry as cancelled and return its handle.
    pub fn mark_cancelled(&mut self, id: &str) -> Option<TransferHandle> {
        let entry = self.transfers.get_mut(id)?;
        if entry.status == TransferStatus::Cancelled {
            return None;
        }
        entry.status = TransferStatus::Cancelled;
        Some(entry.handle.clone())
    }

    /// Remove the entry. Idempotent.
    pub fn end(&mut self, id: &str) -> Option<TransferState> {
        self.transfers.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&TransferState> {
        self.transfers.get(id)
    }

    /// True if `handle` is the live, non-cancelled transfer for its asset.
    pub fn owns(&self, handle: &TransferHandle) -> bool {
        self.transfers.get(&handle.asset_id).is_some_and(|entry| {
            entry.handle.task_id == handle.task_id && entry.status != TransferStatus::Cancelled
        })
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransferState> {
        self.transfers.values()
    }

    /// Re-associate transfers that outlived the previous process.
    ///
    /// Live transfers for assets without a stored copy are registered as
    /// active. Transfers for assets that are already stored, and duplicate
    /// transfers for one asset, are cancelled through the transport. Returns
    /// the cancelled handles.
    pub fn reconcile_on_startup(
        &mut self,
        live: Vec<TransferHandle>,
        store: &AssetStore,
        transport: &dyn Transport,
    ) -> Vec<TransferHandle> {
        let mut cancelled = Vec::new();

        for handle in live {
            if store.locate(&handle.asset_id).is_some() {
                info!(asset_id = %handle.asset_id, task = handle.task_id, "Cancelling orphaned transfer for stored asset");
                transport.cancel(&handle);
                cancelled.push(handle);
                continue;
            }

            if self.transfers.get(&handle.asset_id).is_some_and(|e| e.handle == handle) {
                continue;
            }

            if !self.insert(handle.clone(), TransferStatus::Active) {
                transport.cancel(&handle);
                cancelled.push(handle);
                continue;
            }
            info!(asset_id = %handle.asset_id, task = handle.task_id, "Rediscovered live transfer");
        }

        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::TransferRequest;
    use crate::error::OfflineError;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Transport stand-in that only records cancellations.
    #[derive(Default)]
    struct CancelRecorder {
        cancelled: Mutex<Vec<TransferHandle>>,
    }

    impl Transport for CancelRecorder {
        fn submit(&self, request: TransferRequest) -> Result<TransferHandle, OfflineError> {
            Ok(TransferHandle::new(request.asset_id))
        }

        fn cancel(&self, handle: &TransferHandle) {
            self.cancelled.lock().unwrap().push(handle.clone());
        }

        fn acknowledge(&self, _handle: &TransferHandle) {}

        fn live_transfers(&self) -> Vec<TransferHandle> {
            Vec::new()
        }
    }

    #[test]
    fn test_begin_rejects_second_transfer_for_same_asset() {
        let mut registry = TransferRegistry::new();
        let first = TransferHandle::new("abc");
        assert!(registry.begin(first.clone()));
        assert!(!registry.begin(TransferHandle::new("abc")));
        assert_eq!(registry.get("abc").unwrap().handle, first);
        assert_eq!(registry.get("abc").unwrap().status, TransferStatus::Pending);
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let mut registry = TransferRegistry::new();
        registry.begin(TransferHandle::new("abc"));

        assert!(registry.update_progress("abc", 0.4));
        assert!(!registry.update_progress("abc", 0.2));
        assert_eq!(registry.get("abc").unwrap().progress, Some(0.4));
        assert_eq!(registry.get("abc").unwrap().status, TransferStatus::Active);

        registry.update_progress("abc", 3.0);
        assert_eq!(registry.get("abc").unwrap().progress, Some(1.0));
        assert!(!registry.update_progress("abc", f64::NAN));
    }

    #[test]
    fn test_progress_for_unknown_or_cancelled_is_ignored() {
        let mut registry = TransferRegistry::new();
        assert!(!registry.update_progress("ghost", 0.5));
        assert!(registry.get("ghost").is_none());

        registry.begin(TransferHandle::new("abc"));
        registry.mark_cancelled("abc");
        assert!(!registry.update_progress("abc", 0.5));
        assert_eq!(registry.get("abc").unwrap().progress, None);
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut registry = TransferRegistry::new();
        registry.begin(TransferHandle::new("abc"));
        assert!(registry.end("abc").is_some());
        assert!(registry.end("abc").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_owns_checks_task_id() {
        let mut registry = TransferRegistry::new();
        let current = TransferHandle::new("abc");
        registry.begin(current.clone());

        assert!(registry.owns(&current));
        assert!(!registry.owns(&TransferHandle { asset_id: "abc".into(), task_id: current.task_id.wrapping_add(1) }));

        registry.mark_cancelled("abc");
        assert!(!registry.owns(&current));
    }

    #[test]
    fn test_reconcile_registers_live_and_cancels_orphans() {
        let dir = TempDir::new().unwrap();
        let mut store = AssetStore::open(dir.path().join("media"), dir.path().join("downloads.json"), "mp4");
        store.ensure_storage_dir().unwrap();
        let temp = dir.path().join("done.part");
        fs::write(&temp, b"x").unwrap();
        store.commit("done", &temp).unwrap();

        let transport = CancelRecorder::default();
        let running = TransferHandle::new("running");
        let orphan = TransferHandle::new("done");
        let duplicate = TransferHandle::new("running");

        let mut registry = TransferRegistry::new();
        let cancelled = registry.reconcile_on_startup(
            vec![running.clone(), orphan.clone(), duplicate.clone()],
            &store,
            &transport,
        );

        assert_eq!(cancelled, vec![orphan.clone(), duplicate.clone()]);
        assert_eq!(*transport.cancelled.lock().unwrap(), vec![orphan, duplicate]);
        assert!(registry.owns(&running));
        assert_eq!(registry.get("running").unwrap().status, TransferStatus::Active);
        assert!(registry.get("done").is_none());
    }
}
