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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use querycoord::common::types::{QueryKey, format_uuid};
use querycoord::querycoord_config;
use querycoord::querycoord_logging;
use querycoord::storage::local::LocalQueryStorageCache;
use querycoord::{QueryStatus, QueryStorageCache};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_querycoord.toml");

        // Create a minimal test config
        let config_content = r#"
log_level = "debug"

[storage]
max_staleness_ms = 100
lock_wait_ms = 5000
lock_lease_ms = 10000

[messaging]
publish_timeout_ms = 2000
receive_wait_ms = 500
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        querycoord_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static querycoord_config::QuerycoordConfig> {
        querycoord_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Generate a unique query ID based on the test name.
pub fn unique_query_id(test_name: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    format_uuid(hash as i64, (hash >> 32) as i64)
}

/// A storage cache pre-seeded with one query status record.
pub fn seeded_storage(query_id: &str) -> Arc<LocalQueryStorageCache> {
    let storage = Arc::new(LocalQueryStorageCache::new());
    let status = QueryStatus::new(QueryKey::new("default", query_id, "EventQuery"));
    storage.update_query_status(&status).expect("seed status");
    storage
}
