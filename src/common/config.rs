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

use crate::common::app_config::config as querycoord_app_config;

pub fn max_staleness() -> Duration {
    Duration::from_millis(
        querycoord_app_config()
            .ok()
            .map(|c| c.storage.max_staleness_ms)
            .unwrap_or(300),
    )
}

pub fn lock_wait() -> Duration {
    Duration::from_millis(
        querycoord_app_config()
            .ok()
            .map(|c| c.storage.lock_wait_ms)
            .unwrap_or(30_000),
    )
}

pub fn lock_lease() -> Duration {
    Duration::from_millis(
        querycoord_app_config()
            .ok()
            .map(|c| c.storage.lock_lease_ms)
            .unwrap_or(60_000),
    )
}

pub fn user_idle_timeout() -> Duration {
    Duration::from_millis(
        querycoord_app_config()
            .ok()
            .map(|c| c.storage.user_idle_timeout_ms)
            .unwrap_or(900_000),
    )
}

pub fn progress_idle_timeout() -> Duration {
    Duration::from_millis(
        querycoord_app_config()
            .ok()
            .map(|c| c.storage.progress_idle_timeout_ms)
            .unwrap_or(300_000),
    )
}

pub fn publish_timeout() -> Duration {
    Duration::from_millis(
        querycoord_app_config()
            .ok()
            .map(|c| c.messaging.publish_timeout_ms)
            .unwrap_or(10_000),
    )
}

pub fn receive_wait() -> Duration {
    Duration::from_millis(
        querycoord_app_config()
            .ok()
            .map(|c| c.messaging.receive_wait_ms)
            .unwrap_or(1_000),
    )
}
