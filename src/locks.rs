// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient lock helpers.
//!
//! Lock poisoning occurs when a thread panics while holding a lock. For the
//! worker handle table and the model runtime, stale data is preferable to a
//! denied request, so these helpers recover the guard instead of panicking
//! and log the event for later investigation.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition. Recovering data. \
                 A thread previously panicked while holding this lock."
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
                target: "locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition. Recovering data. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned during acquisition. Recovering data. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}
