// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Locked, atomic JSON files.
//!
//! The downloaded-asset list and the transfer journal are both small JSON
//! documents that must survive crashes and must not be torn by two processes
//! writing at once. Writers hold an exclusive `fs2` lock on a sibling `.lock`
//! file for the whole temp-write + rename; readers hold a shared lock.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Default timeout for acquiring file locks.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn lock_path(path: &Path) -> PathBuf {
    path.with_extension("lock")
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))
}

/// Acquire an exclusive lock on `path`, retrying until `timeout` expires.
pub(crate) fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another instance may be writing the same file.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Acquire a shared lock on an already opened lock file.
pub(crate) fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();

    loop {
        match FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!("Timed out waiting for shared lock after {:?}", timeout);
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(e).context("Failed to acquire shared lock"),
        }
    }
}

/// Load a JSON document, returning `T::default()` if the file does not exist.
pub fn load_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let lock_file = open_lock_file(&lock_path(path))?;
    acquire_shared_lock_with_timeout(&lock_file, LOCK_TIMEOUT)?;

    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value = serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;

    Ok(value)
}

/// Save a JSON document with an exclusive lock and an atomic rename.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let _lock_guard = acquire_exclusive_lock_with_timeout(&lock_path(path), LOCK_TIMEOUT)?;

    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(value).context("Failed to serialize state to JSON")?;

    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

        temp_file.write_all(content.as_bytes()).context("Failed to write to temp file")?;
        temp_file.sync_all().context("Failed to sync temp file to disk")?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} -> {:?}", temp_path, path))?;

    Ok(())
}
