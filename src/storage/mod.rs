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
use std::fmt;
use std::sync::Arc;

pub mod cached;
pub mod local;
pub mod lock;
pub mod query_status;

pub use cached::CachedQueryStatus;
pub use local::{LocalQueryStorageCache, LocalQueryStorageLock};
pub use lock::{LockGuard, QueryStorageLock};
pub use query_status::{CreateStage, QueryState, QueryStatus, QueryStatusView};

use crate::common::types::now_millis;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageErrorKind {
    /// No status record exists for the query id.
    NotFound,
    /// The remote store could not be reached; retryable.
    Unavailable,
    /// Lock acquisition or release failed.
    LockFailed,
    /// A bounded lock wait was interrupted; surfaces as a hard cancellation.
    Interrupted,
}

#[derive(Clone, Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(query_id: &str) -> Self {
        Self::new(
            StorageErrorKind::NotFound,
            format!("no query status for query {}", query_id),
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StorageError {}

/// Remote get/update of a `QueryStatus` by query id, plus per-query lock
/// acquisition. The canonical record lives behind this trait; every node
/// sees the same store.
pub trait QueryStorageCache: Send + Sync {
    fn get_query_status(&self, query_id: &str) -> Result<QueryStatus, StorageError>;

    /// Fleet-wide scan of every known query status.
    fn list_query_status(&self) -> Result<Vec<QueryStatus>, StorageError>;

    fn update_query_status(&self, status: &QueryStatus) -> Result<(), StorageError>;

    fn delete_query_status(&self, query_id: &str) -> Result<(), StorageError>;

    fn query_status_lock(&self, query_id: &str) -> Arc<dyn QueryStorageLock>;

    /// Set the lifecycle state of a query under its distributed lock.
    fn update_query_state(
        &self,
        query_id: &str,
        state: QueryState,
    ) -> Result<QueryStatus, StorageError> {
        let lock = self.query_status_lock(query_id);
        let _guard = LockGuard::acquire(lock.as_ref())?;
        let mut status = self.get_query_status(query_id)?;
        status.query_state = state;
        status.last_updated_millis = now_millis();
        self.update_query_status(&status)?;
        Ok(status)
    }
}
