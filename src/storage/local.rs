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

//! In-process implementation of the query storage contracts. Backs
//! single-node deployments and every concurrency test in this crate; a
//! remote store implements the same traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::common::logging::debug;
use crate::storage::lock::QueryStorageLock;
use crate::storage::query_status::QueryStatus;
use crate::storage::{QueryStorageCache, StorageError, StorageErrorKind};

static NEXT_HOLDER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct LockState {
    holder: Option<u64>,
    lease_deadline: Option<Instant>,
}

/// Shared per-query lock state. Every handle for a query id points at the
/// same cell; holder identity tells handles apart. Lease expiry is
/// evaluated lazily on each acquisition attempt and `is_locked` check.
struct LockCell {
    mu: Mutex<LockState>,
    cv: Condvar,
}

impl LockCell {
    fn new() -> Self {
        Self {
            mu: Mutex::new(LockState::default()),
            cv: Condvar::new(),
        }
    }

    fn clear_expired(state: &mut LockState, now: Instant) {
        if let Some(deadline) = state.lease_deadline {
            if now >= deadline {
                state.holder = None;
                state.lease_deadline = None;
            }
        }
    }

    /// `wait` of `None` blocks indefinitely. Returns false only on timeout.
    fn acquire(&self, holder: u64, wait: Option<Duration>, lease: Option<Duration>) -> bool {
        let wait_deadline = wait.map(|w| Instant::now() + w);
        let mut state = self.mu.lock().expect("lock cell");
        loop {
            let now = Instant::now();
            Self::clear_expired(&mut state, now);
            if state.holder.is_none() {
                state.holder = Some(holder);
                state.lease_deadline = lease.map(|l| now + l);
                return true;
            }

            // Wake at the earlier of our wait deadline and the holder's
            // lease expiry, whichever exists.
            let mut wake = state.lease_deadline;
            if let Some(deadline) = wait_deadline {
                if now >= deadline {
                    return false;
                }
                wake = Some(match wake {
                    Some(w) => w.min(deadline),
                    None => deadline,
                });
            }
            state = match wake {
                Some(w) => {
                    let dur = w
                        .saturating_duration_since(now)
                        .max(Duration::from_millis(1));
                    self.cv.wait_timeout(state, dur).expect("lock cell wait").0
                }
                None => self.cv.wait(state).expect("lock cell wait"),
            };
        }
    }

    /// Release when `holder` matches (or unconditionally for `None`).
    fn release(&self, holder: Option<u64>) -> bool {
        let mut state = self.mu.lock().expect("lock cell");
        if let Some(h) = holder {
            if state.holder != Some(h) {
                return false;
            }
        }
        state.holder = None;
        state.lease_deadline = None;
        self.cv.notify_all();
        true
    }

    fn is_locked(&self) -> bool {
        let mut state = self.mu.lock().expect("lock cell");
        Self::clear_expired(&mut state, Instant::now());
        state.holder.is_some()
    }
}

pub struct LocalQueryStorageLock {
    query_id: String,
    cell: Arc<LockCell>,
    holder_id: u64,
}

impl LocalQueryStorageLock {
    fn new(query_id: String, cell: Arc<LockCell>) -> Self {
        Self {
            query_id,
            cell,
            holder_id: NEXT_HOLDER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl QueryStorageLock for LocalQueryStorageLock {
    fn lock(&self) -> Result<(), StorageError> {
        self.cell.acquire(self.holder_id, None, None);
        Ok(())
    }

    fn lock_lease(&self, lease: Duration) -> Result<(), StorageError> {
        self.cell.acquire(self.holder_id, None, Some(lease));
        Ok(())
    }

    fn try_lock(&self) -> Result<bool, StorageError> {
        Ok(self
            .cell
            .acquire(self.holder_id, Some(Duration::ZERO), None))
    }

    fn try_lock_wait(&self, wait: Duration) -> Result<bool, StorageError> {
        Ok(self.cell.acquire(self.holder_id, Some(wait), None))
    }

    fn try_lock_wait_lease(&self, wait: Duration, lease: Duration) -> Result<bool, StorageError> {
        Ok(self.cell.acquire(self.holder_id, Some(wait), Some(lease)))
    }

    fn unlock(&self) -> Result<(), StorageError> {
        if self.cell.release(Some(self.holder_id)) {
            Ok(())
        } else {
            Err(StorageError::new(
                StorageErrorKind::LockFailed,
                format!("lock for query {} not held by this handle", self.query_id),
            ))
        }
    }

    fn force_unlock(&self) {
        debug!("force unlocking query status lock for {}", self.query_id);
        self.cell.release(None);
    }

    fn is_locked(&self) -> bool {
        self.cell.is_locked()
    }
}

#[derive(Default)]
pub struct LocalQueryStorageCache {
    records: Mutex<HashMap<String, QueryStatus>>,
    locks: Mutex<HashMap<String, Arc<LockCell>>>,
}

impl LocalQueryStorageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_cell(&self, query_id: &str) -> Arc<LockCell> {
        let mut locks = self.locks.lock().expect("lock registry");
        locks
            .entry(query_id.to_string())
            .or_insert_with(|| Arc::new(LockCell::new()))
            .clone()
    }
}

impl QueryStorageCache for LocalQueryStorageCache {
    fn get_query_status(&self, query_id: &str) -> Result<QueryStatus, StorageError> {
        let records = self.records.lock().expect("records");
        records
            .get(query_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(query_id))
    }

    fn list_query_status(&self) -> Result<Vec<QueryStatus>, StorageError> {
        let records = self.records.lock().expect("records");
        Ok(records.values().cloned().collect())
    }

    fn update_query_status(&self, status: &QueryStatus) -> Result<(), StorageError> {
        let mut records = self.records.lock().expect("records");
        records.insert(status.query_id().to_string(), status.clone());
        Ok(())
    }

    fn delete_query_status(&self, query_id: &str) -> Result<(), StorageError> {
        self.records.lock().expect("records").remove(query_id);
        self.locks.lock().expect("lock registry").remove(query_id);
        Ok(())
    }

    fn query_status_lock(&self, query_id: &str) -> Arc<dyn QueryStorageLock> {
        Arc::new(LocalQueryStorageLock::new(
            query_id.to_string(),
            self.lock_cell(query_id),
        ))
    }
}
