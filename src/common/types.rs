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
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Full identity of a query: the pool it runs in, its stable id, and the
/// query logic it executes. The id alone keys all distributed state; pool
/// and logic travel with it for routing and display.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
    pub query_pool: String,
    pub query_id: String,
    pub query_logic: String,
}

impl QueryKey {
    pub fn new(
        query_pool: impl Into<String>,
        query_id: impl Into<String>,
        query_logic: impl Into<String>,
    ) -> Self {
        Self {
            query_pool: query_pool.into(),
            query_id: query_id.into(),
            query_logic: query_logic.into(),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.query_pool, self.query_logic, self.query_id
        )
    }
}

/// Render two 64-bit halves as a UUID-shaped string. Query ids are opaque
/// strings on the wire; this is how deterministic ids are minted in tests.
pub fn format_uuid(hi: i64, lo: i64) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        ((hi as u64) >> 32) as u32,
        ((hi as u64) >> 16) as u16,
        (hi as u64) as u16,
        ((lo as u64) >> 48) as u16,
        (lo as u64) & 0x0000_FFFF_FFFF_FFFF
    )
}

/// Wall-clock epoch millis, used for the last-used/last-updated stamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
