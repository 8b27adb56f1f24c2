// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::time::Duration;

use crate::common::logging::warn;
use crate::storage::StorageError;

/// A named, distributed mutual-exclusion primitive keyed by query id.
///
/// At most one handle holds the lock at a time. Not re-entrant: a handle
/// must not call `lock` twice without an intervening `unlock`. Bounded-wait
/// acquisitions surface interruption as `StorageErrorKind::Interrupted`
/// rather than swallowing it, so query cancellation can unwind cleanly.
pub trait QueryStorageLock: Send + Sync {
    /// Block indefinitely until the lock is held.
    fn lock(&self) -> Result<(), StorageError>;

    /// Block indefinitely; once held, auto-release after `lease` unless
    /// explicitly unlocked first.
    fn lock_lease(&self, lease: Duration) -> Result<(), StorageError>;

    /// Acquire without blocking; `Ok(false)` when contended.
    fn try_lock(&self) -> Result<bool, StorageError>;

    /// Acquire, waiting at most `wait`; `Ok(false)` on timeout.
    fn try_lock_wait(&self, wait: Duration) -> Result<bool, StorageError>;

    /// Bounded wait plus a lease on the eventual hold.
    fn try_lock_wait_lease(&self, wait: Duration, lease: Duration) -> Result<bool, StorageError>;

    /// Release if held by this handle; errors with `LockFailed` otherwise.
    fn unlock(&self) -> Result<(), StorageError>;

    /// Unconditional release, never blocks. Recovery path for locks left
    /// behind by crashed holders.
    fn force_unlock(&self);

    fn is_locked(&self) -> bool;
}

/// Holds a `QueryStorageLock` for a scope, releasing on drop on every exit
/// path. All locked read-modify-write sequences in this crate go through a
/// guard rather than paired lock/unlock calls.
pub struct LockGuard<'a> {
    lock: &'a dyn QueryStorageLock,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(lock: &'a dyn QueryStorageLock) -> Result<Self, StorageError> {
        lock.lock()?;
        Ok(Self { lock })
    }

    /// Bounded acquisition; `Ok(None)` when the wait timed out.
    pub fn acquire_wait(
        lock: &'a dyn QueryStorageLock,
        wait: Duration,
    ) -> Result<Option<Self>, StorageError> {
        if lock.try_lock_wait(wait)? {
            Ok(Some(Self { lock }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            // Lease expiry can legitimately release the lock underneath us.
            warn!("failed to unlock query status lock: {}", err);
        }
    }
}
