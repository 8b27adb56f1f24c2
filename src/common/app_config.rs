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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<QuerycoordConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static QuerycoordConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = QuerycoordConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static QuerycoordConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = QuerycoordConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static QuerycoordConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("QUERYCOORD_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("querycoord.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $QUERYCOORD_CONFIG or create ./querycoord.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct QuerycoordConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "querycoord=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub messaging: MessagingConfig,
}

impl QuerycoordConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: QuerycoordConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for QuerycoordConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            storage: StorageConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct StorageConfig {
    /// How old a cached query status snapshot may get before a read forces
    /// a synchronous reload. Also the period of the background refresh timer.
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: u64,
    /// How long background flushes wait for the per-query distributed lock.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Lease applied to leased lock acquisitions so a crashed holder's lock
    /// is eventually reclaimable.
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    #[serde(default = "default_user_idle_timeout_ms")]
    pub user_idle_timeout_ms: u64,
    #[serde(default = "default_progress_idle_timeout_ms")]
    pub progress_idle_timeout_ms: u64,
}

fn default_max_staleness_ms() -> u64 {
    300
}
fn default_lock_wait_ms() -> u64 {
    30_000
}
fn default_lock_lease_ms() -> u64 {
    60_000
}
fn default_user_idle_timeout_ms() -> u64 {
    900_000
}
fn default_progress_idle_timeout_ms() -> u64 {
    300_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_staleness_ms: default_max_staleness_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            lock_lease_ms: default_lock_lease_ms(),
            user_idle_timeout_ms: default_user_idle_timeout_ms(),
            progress_idle_timeout_ms: default_progress_idle_timeout_ms(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct MessagingConfig {
    /// How long a publisher waits for broker confirmation of one message.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Default wait used by callers polling a listener for the next page.
    #[serde(default = "default_receive_wait_ms")]
    pub receive_wait_ms: u64,
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}
fn default_receive_wait_ms() -> u64 {
    1_000
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            publish_timeout_ms: default_publish_timeout_ms(),
            receive_wait_ms: default_receive_wait_ms(),
        }
    }
}
