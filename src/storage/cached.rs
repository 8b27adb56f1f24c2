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

//! Staleness-bounded local facade over the shared query status record.
//!
//! Readers get a snapshot that is at most `max_staleness` old without a
//! remote round trip per call. Writers get locked read-modify-write through
//! [`CachedQueryStatus::update_query_status`]. The per-result hot counters
//! (generated, returned, next, seek) accumulate in local pending deltas and
//! are reconciled into the store lazily, so result production never
//! serializes on the distributed lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::config;
use crate::common::logging::warn;
use crate::common::types::{QueryKey, now_millis};
use crate::storage::lock::LockGuard;
use crate::storage::query_status::{CreateStage, QueryState, QueryStatus, QueryStatusView};
use crate::storage::{QueryStorageCache, StorageError, StorageErrorKind};

/// Hot-counter deltas accumulated since the last reconciliation. They exist
/// only between refreshes: a successful flush folds them into the persisted
/// record and zeroes them in the same critical section, so each increment
/// is absorbed exactly once.
#[derive(Default)]
struct PendingCounters {
    generated: u64,
    returned: u64,
    next: u64,
    seek: u64,
    used_millis: Option<u64>,
}

impl PendingCounters {
    fn apply_to(&self, status: &mut QueryStatus) {
        status.num_results_generated += self.generated;
        status.num_results_returned += self.returned;
        status.next_count += self.next;
        status.seek_count += self.seek;
        if let Some(used) = self.used_millis {
            status.last_used_millis = status.last_used_millis.max(used);
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }

    fn is_dirty(&self) -> bool {
        self.generated != 0
            || self.returned != 0
            || self.next != 0
            || self.seek != 0
            || self.used_millis.is_some()
    }
}

struct CacheState {
    status: QueryStatus,
    last_refresh: Instant,
    pending: PendingCounters,
}

struct Shared {
    query_id: String,
    storage: Arc<dyn QueryStorageCache>,
    max_staleness: Duration,
    inner: Mutex<CacheState>,
    timer_active: AtomicBool,
}

impl Shared {
    /// Read path. While a refresh timer runs, staleness is bounded by the
    /// timer period and reads never block on the network.
    fn get(&self) -> Result<QueryStatus, StorageError> {
        let mut state = self.inner.lock().expect("status cache");
        if !self.timer_active.load(Ordering::Acquire)
            && state.last_refresh.elapsed() > self.max_staleness
        {
            self.reconcile(&mut state, None)?;
        }
        Ok(state.status.clone())
    }

    /// Plain reload for a clean cache; dirty caches must reconcile under
    /// the distributed lock so pending deltas are persisted, not dropped.
    fn reload_clean(&self, state: &mut CacheState) -> Result<(), StorageError> {
        let fresh = self.storage.get_query_status(&self.query_id)?;
        state.status = fresh;
        state.last_refresh = Instant::now();
        Ok(())
    }

    fn reconcile(
        &self,
        state: &mut CacheState,
        lock_wait: Option<Duration>,
    ) -> Result<(), StorageError> {
        if !state.pending.is_dirty() {
            return self.reload_clean(state);
        }
        self.flush(state, lock_wait, |_| {})
    }

    /// Locked read-reconcile-write. Reloads the latest persisted record,
    /// folds pending deltas into it, applies `mutator`, persists, and
    /// installs the merged record as the new snapshot. Pending deltas are
    /// zeroed only after the write succeeds, so a store failure delays the
    /// counts instead of losing them.
    fn flush<F>(
        &self,
        state: &mut CacheState,
        lock_wait: Option<Duration>,
        mutator: F,
    ) -> Result<(), StorageError>
    where
        F: FnOnce(&mut QueryStatus),
    {
        let lock = self.storage.query_status_lock(&self.query_id);
        let _guard = match lock_wait {
            None => LockGuard::acquire(lock.as_ref())?,
            Some(wait) => LockGuard::acquire_wait(lock.as_ref(), wait)?.ok_or_else(|| {
                StorageError::new(
                    StorageErrorKind::LockFailed,
                    format!(
                        "timed out after {:?} waiting for status lock of query {}",
                        wait, self.query_id
                    ),
                )
            })?,
        };

        let mut merged = self.storage.get_query_status(&self.query_id)?;
        state.pending.apply_to(&mut merged);
        mutator(&mut merged);
        merged.last_updated_millis = now_millis();
        self.storage.update_query_status(&merged)?;

        state.pending.clear();
        state.status = merged;
        state.last_refresh = Instant::now();
        Ok(())
    }

    /// One tick of the background timer. Failures are logged and the
    /// pending deltas stay in memory for the next tick.
    fn timer_refresh(&self) {
        let mut state = self.inner.lock().expect("status cache");
        if let Err(err) = self.reconcile(&mut state, Some(config::lock_wait())) {
            warn!(
                "background refresh of query {} failed, retrying next tick: {}",
                self.query_id, err
            );
        }
    }
}

struct TimerStop {
    mu: Mutex<bool>,
    cv: Condvar,
}

struct RefreshTimer {
    stop: Arc<TimerStop>,
    handle: thread::JoinHandle<()>,
}

/// Local facade over one query's shared status record. One instance per
/// (process, query id) pair; instances on different nodes coordinate only
/// through the store and its per-query lock.
pub struct CachedQueryStatus {
    shared: Arc<Shared>,
    timer: Mutex<Option<RefreshTimer>>,
}

impl std::fmt::Debug for CachedQueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedQueryStatus")
            .field("query_id", &self.shared.query_id)
            .finish_non_exhaustive()
    }
}

impl CachedQueryStatus {
    /// Performs one synchronous load; fails fast when the query is unknown.
    pub fn new(
        storage: Arc<dyn QueryStorageCache>,
        query_id: &str,
        max_staleness: Duration,
    ) -> Result<Self, StorageError> {
        let status = storage.get_query_status(query_id)?;
        Ok(Self {
            shared: Arc::new(Shared {
                query_id: query_id.to_string(),
                storage,
                max_staleness,
                inner: Mutex::new(CacheState {
                    status,
                    last_refresh: Instant::now(),
                    pending: PendingCounters::default(),
                }),
                timer_active: AtomicBool::new(false),
            }),
            timer: Mutex::new(None),
        })
    }

    /// Staleness bound taken from the loaded configuration.
    pub fn from_config(
        storage: Arc<dyn QueryStorageCache>,
        query_id: &str,
    ) -> Result<Self, StorageError> {
        Self::new(storage, query_id, config::max_staleness())
    }

    pub fn query_id(&self) -> &str {
        &self.shared.query_id
    }

    /// Current snapshot, refreshed first when it is older than the
    /// staleness bound and no timer is running.
    pub fn get(&self) -> Result<QueryStatus, StorageError> {
        self.shared.get()
    }

    /// Locked read-modify-write of the shared record. Pending counter
    /// deltas are reconciled before `mutator` runs, so a write never
    /// clobbers counters incremented on this or any other node.
    pub fn update_query_status<F>(&self, mutator: F) -> Result<QueryStatus, StorageError>
    where
        F: FnOnce(&mut QueryStatus),
    {
        let mut state = self.shared.inner.lock().expect("status cache");
        self.shared.flush(&mut state, None, mutator)?;
        Ok(state.status.clone())
    }

    pub fn increment_num_results_generated(&self, delta: u64) {
        let mut state = self.shared.inner.lock().expect("status cache");
        state.pending.generated += delta;
    }

    pub fn increment_num_results_returned(&self, delta: u64) {
        let mut state = self.shared.inner.lock().expect("status cache");
        state.pending.returned += delta;
    }

    pub fn increment_next_count(&self, delta: u64) {
        let mut state = self.shared.inner.lock().expect("status cache");
        state.pending.next += delta;
    }

    pub fn increment_seek_count(&self, delta: u64) {
        let mut state = self.shared.inner.lock().expect("status cache");
        state.pending.seek += delta;
    }

    /// Consumed counts feed page accounting elsewhere and need strong
    /// consistency, so this one writes through the lock immediately instead
    /// of batching locally.
    pub fn increment_num_results_consumed(&self, delta: u64) -> Result<QueryStatus, StorageError> {
        self.update_query_status(|status| status.num_results_consumed += delta)
    }

    /// Marks client activity without a lock round trip; the stamp rides
    /// along with the next reconciliation.
    pub fn touch(&self) {
        let mut state = self.shared.inner.lock().expect("status cache");
        state.pending.used_millis = Some(now_millis());
    }

    /// Flush pending deltas and refresh, regardless of timer state.
    pub fn force_cache_update(&self) -> Result<(), StorageError> {
        let mut state = self.shared.inner.lock().expect("status cache");
        if state.pending.is_dirty() {
            self.shared.flush(&mut state, None, |_| {})
        } else {
            self.shared.reload_clean(&mut state)
        }
    }

    /// Flush only when a pending delta exists.
    pub fn force_cache_update_if_dirty(&self) -> Result<(), StorageError> {
        let mut state = self.shared.inner.lock().expect("status cache");
        if state.pending.is_dirty() {
            self.shared.flush(&mut state, None, |_| {})
        } else {
            Ok(())
        }
    }

    /// Switch from on-demand refresh to periodic refresh with period
    /// `max_staleness`. While the timer runs, `get` never blocks on the
    /// network. No-op when already running.
    pub fn start_timer(&self) {
        let mut timer = self.timer.lock().expect("refresh timer");
        if timer.is_some() {
            return;
        }
        let stop = Arc::new(TimerStop {
            mu: Mutex::new(false),
            cv: Condvar::new(),
        });
        let shared = Arc::clone(&self.shared);
        shared.timer_active.store(true, Ordering::Release);
        let period = shared.max_staleness;
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut stopped = thread_stop.mu.lock().expect("timer stop");
            loop {
                let (guard, wait) = thread_stop
                    .cv
                    .wait_timeout(stopped, period)
                    .expect("timer wait");
                stopped = guard;
                if *stopped {
                    break;
                }
                if wait.timed_out() {
                    drop(stopped);
                    shared.timer_refresh();
                    stopped = thread_stop.mu.lock().expect("timer stop");
                }
            }
        });
        *timer = Some(RefreshTimer { stop, handle });
    }

    /// Stop and join the refresh timer. Reads fall back to on-demand
    /// refresh. No-op when not running.
    pub fn stop_timer(&self) {
        let timer = self.timer.lock().expect("refresh timer").take();
        if let Some(timer) = timer {
            self.shared.timer_active.store(false, Ordering::Release);
            *timer.stop.mu.lock().expect("timer stop") = true;
            timer.stop.cv.notify_all();
            let _ = timer.handle.join();
        }
    }

    pub fn is_timer_running(&self) -> bool {
        self.timer.lock().expect("refresh timer").is_some()
    }
}

impl Drop for CachedQueryStatus {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

impl QueryStatusView for CachedQueryStatus {
    fn query_key(&self) -> Result<QueryKey, StorageError> {
        Ok(self.get()?.query_key)
    }
    fn query_state(&self) -> Result<QueryState, StorageError> {
        Ok(self.get()?.query_state)
    }
    fn create_stage(&self) -> Result<CreateStage, StorageError> {
        Ok(self.get()?.create_stage)
    }
    fn plan(&self) -> Result<Option<String>, StorageError> {
        Ok(self.get()?.plan)
    }
    fn predictions(&self) -> Result<Option<String>, StorageError> {
        Ok(self.get()?.predictions)
    }

    // The four hot counters answer from the snapshot plus the local pending
    // delta, with no remote traffic and no staleness check.
    fn num_results_generated(&self) -> Result<u64, StorageError> {
        let state = self.shared.inner.lock().expect("status cache");
        Ok(state.status.num_results_generated + state.pending.generated)
    }
    fn num_results_returned(&self) -> Result<u64, StorageError> {
        let state = self.shared.inner.lock().expect("status cache");
        Ok(state.status.num_results_returned + state.pending.returned)
    }
    fn next_count(&self) -> Result<u64, StorageError> {
        let state = self.shared.inner.lock().expect("status cache");
        Ok(state.status.next_count + state.pending.next)
    }
    fn seek_count(&self) -> Result<u64, StorageError> {
        let state = self.shared.inner.lock().expect("status cache");
        Ok(state.status.seek_count + state.pending.seek)
    }

    fn num_results_consumed(&self) -> Result<u64, StorageError> {
        Ok(self.get()?.num_results_consumed)
    }
    fn active_next_calls(&self) -> Result<u64, StorageError> {
        Ok(self.get()?.active_next_calls)
    }
    fn last_page_number(&self) -> Result<u64, StorageError> {
        Ok(self.get()?.last_page_number)
    }
    fn last_used_millis(&self) -> Result<u64, StorageError> {
        Ok(self.get()?.last_used_millis)
    }
    fn last_updated_millis(&self) -> Result<u64, StorageError> {
        Ok(self.get()?.last_updated_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::QueryKey;
    use crate::storage::local::LocalQueryStorageCache;
    use crate::storage::lock::QueryStorageLock;
    use std::sync::atomic::AtomicU64;

    const STALENESS: Duration = Duration::from_millis(60_000);

    fn seeded_storage(query_id: &str) -> Arc<LocalQueryStorageCache> {
        let storage = Arc::new(LocalQueryStorageCache::new());
        let status = QueryStatus::new(QueryKey::new("default", query_id, "EventQuery"));
        storage.update_query_status(&status).expect("seed");
        storage
    }

    /// Delegates to a local store while counting remote reads and
    /// optionally failing them, for staleness and retention assertions.
    struct InstrumentedStorage {
        inner: LocalQueryStorageCache,
        loads: AtomicU64,
        fail_loads: AtomicBool,
    }

    impl InstrumentedStorage {
        fn seeded(query_id: &str) -> Arc<Self> {
            let inner = LocalQueryStorageCache::new();
            let status = QueryStatus::new(QueryKey::new("default", query_id, "EventQuery"));
            inner.update_query_status(&status).expect("seed");
            Arc::new(Self {
                inner,
                loads: AtomicU64::new(0),
                fail_loads: AtomicBool::new(false),
            })
        }
    }

    impl QueryStorageCache for InstrumentedStorage {
        fn get_query_status(&self, query_id: &str) -> Result<QueryStatus, StorageError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(StorageError::new(
                    StorageErrorKind::Unavailable,
                    "store offline",
                ));
            }
            self.inner.get_query_status(query_id)
        }
        fn list_query_status(&self) -> Result<Vec<QueryStatus>, StorageError> {
            self.inner.list_query_status()
        }
        fn update_query_status(&self, status: &QueryStatus) -> Result<(), StorageError> {
            self.inner.update_query_status(status)
        }
        fn delete_query_status(&self, query_id: &str) -> Result<(), StorageError> {
            self.inner.delete_query_status(query_id)
        }
        fn query_status_lock(&self, query_id: &str) -> Arc<dyn QueryStorageLock> {
            self.inner.query_status_lock(query_id)
        }
    }

    #[test]
    fn counter_conservation_across_reconciliation() {
        let storage = seeded_storage("q1");
        let cached = CachedQueryStatus::new(storage.clone(), "q1", STALENESS).expect("cached");

        cached.increment_num_results_generated(3);
        cached.increment_num_results_generated(4);
        cached.increment_num_results_returned(2);
        assert_eq!(cached.num_results_generated().expect("generated"), 7);
        assert_eq!(cached.num_results_returned().expect("returned"), 2);
        // nothing persisted yet
        assert_eq!(
            storage
                .get_query_status("q1")
                .expect("get")
                .num_results_generated,
            0
        );

        cached.force_cache_update().expect("flush");
        let persisted = storage.get_query_status("q1").expect("get");
        assert_eq!(persisted.num_results_generated, 7);
        assert_eq!(persisted.num_results_returned, 2);
        // getter unchanged, pending absorbed exactly once
        assert_eq!(cached.num_results_generated().expect("generated"), 7);

        // a second flush must not re-add the old deltas
        cached.increment_num_results_generated(1);
        cached.force_cache_update().expect("flush again");
        assert_eq!(
            storage
                .get_query_status("q1")
                .expect("get")
                .num_results_generated,
            8
        );
    }

    #[test]
    fn force_cache_update_if_dirty_skips_clean_cache() {
        let storage = InstrumentedStorage::seeded("q1");
        let cached =
            CachedQueryStatus::new(storage.clone(), "q1", STALENESS).expect("cached");
        let loads_after_create = storage.loads.load(Ordering::SeqCst);

        cached.force_cache_update_if_dirty().expect("clean no-op");
        assert_eq!(storage.loads.load(Ordering::SeqCst), loads_after_create);

        cached.increment_next_count(1);
        cached.force_cache_update_if_dirty().expect("dirty flush");
        assert!(storage.loads.load(Ordering::SeqCst) > loads_after_create);
        assert_eq!(storage.inner.get_query_status("q1").expect("get").next_count, 1);
    }

    #[test]
    fn stale_read_triggers_exactly_one_reload() {
        let storage = InstrumentedStorage::seeded("q1");
        let staleness = Duration::from_millis(50);
        let cached = CachedQueryStatus::new(storage.clone(), "q1", staleness).expect("cached");
        let baseline = storage.loads.load(Ordering::SeqCst);

        // fresh enough: no remote read
        cached.get().expect("get");
        assert_eq!(storage.loads.load(Ordering::SeqCst), baseline);

        thread::sleep(Duration::from_millis(80));
        cached.get().expect("stale get");
        assert_eq!(storage.loads.load(Ordering::SeqCst), baseline + 1);

        // refreshed again means fresh again
        cached.get().expect("get");
        assert_eq!(storage.loads.load(Ordering::SeqCst), baseline + 1);
    }

    #[test]
    fn hot_counter_getters_do_not_touch_the_store() {
        let storage = InstrumentedStorage::seeded("q1");
        let staleness = Duration::from_millis(10);
        let cached = CachedQueryStatus::new(storage.clone(), "q1", staleness).expect("cached");
        let baseline = storage.loads.load(Ordering::SeqCst);

        thread::sleep(Duration::from_millis(30));
        cached.increment_seek_count(5);
        assert_eq!(cached.seek_count().expect("seek"), 5);
        assert_eq!(cached.num_results_generated().expect("generated"), 0);
        assert_eq!(storage.loads.load(Ordering::SeqCst), baseline);
    }

    #[test]
    fn pending_deltas_survive_store_outage() {
        let storage = InstrumentedStorage::seeded("q1");
        let cached =
            CachedQueryStatus::new(storage.clone(), "q1", STALENESS).expect("cached");

        cached.increment_num_results_generated(5);
        storage.fail_loads.store(true, Ordering::SeqCst);
        let err = cached.force_cache_update().expect_err("store offline");
        assert_eq!(err.kind, StorageErrorKind::Unavailable);
        // deltas retained, still visible locally
        assert_eq!(cached.num_results_generated().expect("generated"), 5);

        storage.fail_loads.store(false, Ordering::SeqCst);
        cached.force_cache_update().expect("retry succeeds");
        assert_eq!(
            storage
                .inner
                .get_query_status("q1")
                .expect("get")
                .num_results_generated,
            5
        );
        assert_eq!(cached.num_results_generated().expect("generated"), 5);
    }

    #[test]
    fn update_reconciles_pending_before_mutating() {
        let storage = seeded_storage("q1");
        let cached = CachedQueryStatus::new(storage.clone(), "q1", STALENESS).expect("cached");

        cached.increment_num_results_generated(10);
        let updated = cached
            .update_query_status(|status| {
                status.query_state = QueryState::Running;
                status.last_page_number += 1;
            })
            .expect("update");
        assert_eq!(updated.query_state, QueryState::Running);
        assert_eq!(updated.num_results_generated, 10);
        assert_eq!(updated.last_page_number, 1);

        let persisted = storage.get_query_status("q1").expect("get");
        assert_eq!(persisted.num_results_generated, 10);
        assert_eq!(persisted.query_state, QueryState::Running);
        assert!(!storage.query_status_lock("q1").is_locked());
    }

    #[test]
    fn consumed_count_writes_through_immediately() {
        let storage = seeded_storage("q1");
        let cached = CachedQueryStatus::new(storage.clone(), "q1", STALENESS).expect("cached");

        cached.increment_num_results_consumed(3).expect("consumed");
        assert_eq!(
            storage
                .get_query_status("q1")
                .expect("get")
                .num_results_consumed,
            3
        );
    }

    #[test]
    fn touch_rides_along_with_the_next_flush() {
        let storage = seeded_storage("q1");
        let mut seeded = storage.get_query_status("q1").expect("get");
        seeded.last_used_millis = 0;
        storage.update_query_status(&seeded).expect("reset");

        let cached = CachedQueryStatus::new(storage.clone(), "q1", STALENESS).expect("cached");
        cached.touch();
        cached.force_cache_update_if_dirty().expect("flush");
        assert!(storage.get_query_status("q1").expect("get").last_used_millis > 0);
    }

    #[test]
    fn missing_query_fails_construction() {
        let storage: Arc<dyn QueryStorageCache> = Arc::new(LocalQueryStorageCache::new());
        let err = CachedQueryStatus::new(storage, "nope", STALENESS).expect_err("missing");
        assert_eq!(err.kind, StorageErrorKind::NotFound);
    }
}
