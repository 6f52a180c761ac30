// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable record of which assets are available offline.
//!
//! The persisted id list is only a hint: every id is checked against the
//! filesystem when the store is reconciled, and `locate` re-checks at call
//! time, so a cache directory cleared behind our back never shows up as a
//! playable download.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::OfflineError;
use crate::persist;
use crate::types::storage_file_name;

/// On-disk format of the downloaded-asset list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedAssets {
    /// Version for future migrations
    version: u32,
    downloaded: Vec<String>,
    last_saved: Option<DateTime<Utc>>,
}

impl Default for PersistedAssets {
    fn default() -> Self {
        Self {
            version: 1,
            downloaded: Vec::new(),
            last_saved: None,
        }
    }
}

/// Mapping of asset id to committed file, backed by a JSON id list.
#[derive(Debug)]
pub struct AssetStore {
    storage_dir: PathBuf,
    state_path: PathBuf,
    extension: String,
    present: BTreeSet<String>,
}

impl AssetStore {
    /// Load the persisted id list without verifying it.
    ///
    /// An unreadable list is logged and treated as empty.
    pub fn load(storage_dir: impl Into<PathBuf>, state_path: impl Into<PathBuf>, extension: &str) -> Self {
        let storage_dir = storage_dir.into();
        let state_path = state_path.into();

        let persisted: PersistedAssets = persist::load_json(&state_path).unwrap_or_else(|e| {
            warn!("Failed to load downloaded list {:?}, starting empty: {:#}", state_path, e);
            PersistedAssets::default()
        });

        Self {
            storage_dir,
            state_path,
            extension: extension.trim_start_matches('.').to_string(),
            present: persisted.downloaded.into_iter().collect(),
        }
    }

    /// Load and reconcile in one step.
    pub fn open(storage_dir: impl Into<PathBuf>, state_path: impl Into<PathBuf>, extension: &str) -> Self {
        let mut store = Self::load(storage_dir, state_path, extension);
        store.reconcile();
        store
    }

    /// Drop every id whose file is gone and re-persist if anything changed.
    ///
    /// Returns the dropped ids.
    pub fn reconcile(&mut self) -> Vec<String> {
        let missing: Vec<String> = self
            .present
            .iter()
            .filter(|id| !self.file_path(id).is_file())
            .cloned()
            .collect();

        if missing.is_empty() {
            return missing;
        }

        for id in &missing {
            self.present.remove(id);
        }
        info!(dropped = missing.len(), "Dropped downloads whose files are missing: {:?}", missing);
        self.save_best_effort();
        missing
    }

    /// True iff a verified record exists for the id.
    pub fn is_present(&self, id: &str) -> bool {
        self.present.contains(id)
    }

    /// Path of the committed file, only if it still exists right now.
    pub fn locate(&self, id: &str) -> Option<PathBuf> {
        if !self.present.contains(id) {
            return None;
        }
        let path = self.file_path(id);
        path.is_file().then_some(path)
    }

    /// Where the file for `id` lives (whether or not it exists).
    pub fn file_path(&self, id: &str) -> PathBuf {
        self.storage_dir.join(storage_file_name(id, &self.extension))
    }

    /// Asset id whose committed file is `path`.
    ///
    /// Hashed file names cannot be turned back into ids, so playback of a
    /// stored file is resolved here rather than from the file name.
    pub fn id_for_path(&self, path: &Path) -> Option<String> {
        self.present.iter().find(|id| self.file_path(id) == path).cloned()
    }

    /// Ids recorded as present, in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.present.iter()
    }

    pub fn ensure_storage_dir(&self) -> Result<(), OfflineError> {
        fs::create_dir_all(&self.storage_dir).map_err(|e| {
            OfflineError::IoFailure(format!("cannot create {:?}: {}", self.storage_dir, e))
        })
    }

    /// Move a finished transfer's file into storage and record the id.
    ///
    /// A stale file for the same id is overwritten. On failure the id is not
    /// recorded.
    pub fn commit(&mut self, id: &str, source_temp: &Path) -> Result<PathBuf, OfflineError> {
        let target = self.file_path(id);

        if target.exists() {
            fs::remove_file(&target).map_err(|e| {
                OfflineError::IoFailure(format!("cannot replace stale {:?}: {}", target, e))
            })?;
        }

        if let Err(rename_err) = fs::rename(source_temp, &target) {
            // Staging may sit on another filesystem; fall back to copy + delete.
            debug!("rename {:?} -> {:?} failed ({}), copying", source_temp, target, rename_err);
            if let Err(copy_err) = fs::copy(source_temp, &target) {
                let _ = fs::remove_file(&target);
                return Err(OfflineError::IoFailure(format!(
                    "cannot move {:?} into storage: {}",
                    source_temp, copy_err
                )));
            }
            if let Err(e) = fs::remove_file(source_temp) {
                warn!("Committed copy of {} but could not remove {:?}: {}", id, source_temp, e);
            }
        }

        self.present.insert(id.to_string());
        self.save_best_effort();
        Ok(target)
    }

    /// Delete the file and the record.
    ///
    /// `NotFound` if neither exists. If deleting an existing file fails the
    /// record is kept and `IoFailure` is returned.
    pub fn remove(&mut self, id: &str) -> Result<(), OfflineError> {
        let path = self.file_path(id);
        let recorded = self.present.contains(id);
        let exists = path.exists();

        if !recorded && !exists {
            return Err(OfflineError::NotFound(id.to_string()));
        }

        if exists {
            fs::remove_file(&path)
                .map_err(|e| OfflineError::IoFailure(format!("cannot delete {:?}: {}", path, e)))?;
        }

        if recorded {
            self.present.remove(id);
            self.save_best_effort();
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let persisted = PersistedAssets {
            version: 1,
            downloaded: self.present.iter().cloned().collect(),
            last_saved: Some(Utc::now()),
        };
        persist::save_json(&self.state_path, &persisted)
    }

    /// Persist, logging failures. The next mutation writes the full set again.
    fn save_best_effort(&self) {
        if let Err(e) = self.save() {
            warn!("Failed to persist downloaded list {:?}: {:#}", self.state_path, e);
        }
    }
}
