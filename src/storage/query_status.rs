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

use serde::{Deserialize, Serialize};

use crate::common::types::{QueryKey, now_millis};
use crate::storage::StorageError;

/// Lifecycle state of one query. Defined when the definition is stored,
/// Created once executors are tasked, Running while pages are produced,
/// then exactly one of the three terminal states.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    #[default]
    Defined,
    Created,
    Running,
    Closed,
    Canceled,
    Failed,
}

impl QueryState {
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Closed | Self::Canceled | Self::Failed)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

/// How far query creation has progressed on the executor side.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateStage {
    #[default]
    Create,
    Plan,
    Task,
    Results,
}

/// Canonical mutable state of one query. One record per query id, owned by
/// the distributed store and concurrently mutated by any node holding the
/// per-query lock. All counters are monotonically non-decreasing for the
/// life of the query; `last_updated_millis` is only advanced by a
/// successful write-back.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStatus {
    pub query_key: QueryKey,

    pub query_state: QueryState,
    pub create_stage: CreateStage,
    pub plan: Option<String>,
    pub predictions: Option<String>,

    /// The original query definition, opaque to this layer.
    pub query: Option<serde_json::Value>,
    pub current_user: Option<String>,
    pub calculated_auths: Vec<String>,

    pub num_results_generated: u64,
    pub num_results_returned: u64,
    pub num_results_consumed: u64,
    pub next_count: u64,
    pub seek_count: u64,
    pub active_next_calls: u64,
    pub last_page_number: u64,

    pub last_used_millis: u64,
    pub last_updated_millis: u64,

    pub error_code: Option<i32>,
    pub failure_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl QueryStatus {
    pub fn new(query_key: QueryKey) -> Self {
        let now = now_millis();
        Self {
            query_key,
            last_used_millis: now,
            last_updated_millis: now,
            ..Self::default()
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_key.query_id
    }

    /// No client has touched the query (next page, status poll) within the
    /// timeout. Used to expire abandoned queries.
    pub fn is_user_idle(&self, now_millis: u64, timeout: Duration) -> bool {
        now_millis.saturating_sub(self.last_used_millis) > timeout.as_millis() as u64
    }

    /// No node has persisted any progress within the timeout. Distinguishes
    /// a slow query from a wedged one.
    pub fn is_progress_idle(&self, now_millis: u64, timeout: Duration) -> bool {
        now_millis.saturating_sub(self.last_updated_millis) > timeout.as_millis() as u64
    }

    pub fn set_failure(&mut self, error_code: i32, message: impl Into<String>) {
        self.query_state = QueryState::Failed;
        self.error_code = Some(error_code);
        self.failure_message = Some(message.into());
    }
}

/// Read surface shared by the plain record and the caching decorator.
///
/// The plain `QueryStatus` answers from its own fields and never fails; the
/// cached implementation may touch the remote store, so every getter
/// returns a `Result`.
pub trait QueryStatusView {
    fn query_key(&self) -> Result<QueryKey, StorageError>;
    fn query_state(&self) -> Result<QueryState, StorageError>;
    fn create_stage(&self) -> Result<CreateStage, StorageError>;
    fn plan(&self) -> Result<Option<String>, StorageError>;
    fn predictions(&self) -> Result<Option<String>, StorageError>;
    fn num_results_generated(&self) -> Result<u64, StorageError>;
    fn num_results_returned(&self) -> Result<u64, StorageError>;
    fn num_results_consumed(&self) -> Result<u64, StorageError>;
    fn next_count(&self) -> Result<u64, StorageError>;
    fn seek_count(&self) -> Result<u64, StorageError>;
    fn active_next_calls(&self) -> Result<u64, StorageError>;
    fn last_page_number(&self) -> Result<u64, StorageError>;
    fn last_used_millis(&self) -> Result<u64, StorageError>;
    fn last_updated_millis(&self) -> Result<u64, StorageError>;
}

impl QueryStatusView for QueryStatus {
    fn query_key(&self) -> Result<QueryKey, StorageError> {
        Ok(self.query_key.clone())
    }
    fn query_state(&self) -> Result<QueryState, StorageError> {
        Ok(self.query_state)
    }
    fn create_stage(&self) -> Result<CreateStage, StorageError> {
        Ok(self.create_stage)
    }
    fn plan(&self) -> Result<Option<String>, StorageError> {
        Ok(self.plan.clone())
    }
    fn predictions(&self) -> Result<Option<String>, StorageError> {
        Ok(self.predictions.clone())
    }
    fn num_results_generated(&self) -> Result<u64, StorageError> {
        Ok(self.num_results_generated)
    }
    fn num_results_returned(&self) -> Result<u64, StorageError> {
        Ok(self.num_results_returned)
    }
    fn num_results_consumed(&self) -> Result<u64, StorageError> {
        Ok(self.num_results_consumed)
    }
    fn next_count(&self) -> Result<u64, StorageError> {
        Ok(self.next_count)
    }
    fn seek_count(&self) -> Result<u64, StorageError> {
        Ok(self.seek_count)
    }
    fn active_next_calls(&self) -> Result<u64, StorageError> {
        Ok(self.active_next_calls)
    }
    fn last_page_number(&self) -> Result<u64, StorageError> {
        Ok(self.last_page_number)
    }
    fn last_used_millis(&self) -> Result<u64, StorageError> {
        Ok(self.last_used_millis)
    }
    fn last_updated_millis(&self) -> Result<u64, StorageError> {
        Ok(self.last_updated_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_not_active() {
        assert!(QueryState::Defined.is_active());
        assert!(QueryState::Created.is_active());
        assert!(QueryState::Running.is_active());
        assert!(!QueryState::Closed.is_active());
        assert!(!QueryState::Canceled.is_active());
        assert!(!QueryState::Failed.is_active());
    }

    #[test]
    fn idle_detection_uses_the_right_stamp() {
        let mut status = QueryStatus::new(QueryKey::new("default", "q1", "EventQuery"));
        status.last_used_millis = 1_000;
        status.last_updated_millis = 5_000;
        let timeout = Duration::from_millis(2_000);
        assert!(status.is_user_idle(4_000, timeout));
        assert!(!status.is_progress_idle(4_000, timeout));
        assert!(status.is_progress_idle(8_000, timeout));
    }

    #[test]
    fn set_failure_moves_to_failed() {
        let mut status = QueryStatus::new(QueryKey::new("default", "q1", "EventQuery"));
        status.set_failure(500, "executor died");
        assert_eq!(status.query_state, QueryState::Failed);
        assert_eq!(status.error_code, Some(500));
        assert!(!status.query_state.is_active());
    }
}
