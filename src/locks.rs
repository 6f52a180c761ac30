// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! Coordinator and transport state is only locked through these helpers.
//! A poisoned lock is logged and its guard handed back.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "tubeoffline::locks",
                event = "LOCK_POISONED_READ",
                "RwLock poisoned during read; recovering possibly stale coordinator state"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "tubeoffline::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock poisoned during write; recovering possibly stale coordinator state"
            );
            poisoned.into_inner()
        }
    }
}
