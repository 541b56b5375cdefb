// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::tx::Isolation;
use eyre::eyre;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SLOW_COMMIT_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Applies to every transaction that does not set its own. `None` means wait forever.
    pub transaction_timeout: Option<Duration>,
    /// Attempts after the first when a transaction is run with `retry_on_conflict`.
    pub max_retries: usize,
    /// Base delay between retries; scaled by the attempt number and jittered.
    pub retry_backoff: Duration,
    /// For entities that do not declare their own isolation.
    pub default_isolation: Isolation,
    /// How many recent inbound event ids to remember for duplicate suppression.
    pub dedup_window: usize,
    /// Commits slower than this are logged at warn.
    pub slow_commit_threshold: Duration,
    pub batch: BatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: Some(DEFAULT_TRANSACTION_TIMEOUT),
            max_retries: 10,
            retry_backoff: Duration::from_millis(5),
            default_isolation: Isolation::default(),
            dedup_window: 4096,
            slow_commit_threshold: DEFAULT_SLOW_COMMIT_THRESHOLD,
            batch: BatchConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub workers: usize,
    /// Operations accumulated per partition before they are handed to the worker as one unit.
    pub batch_size: usize,
    /// Apply inserts straight to the index with deferred overlap validation, bypassing
    /// transactions.
    pub bulk_insert: bool,
    pub bulk_batch_size: usize,
    /// Total tries for one unit before the error handler's requeue gives up.
    pub max_attempts: usize,
    pub log_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            bulk_insert: false,
            bulk_batch_size: 1000,
            max_attempts: 5,
            log_interval: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Defaults, overlaid by the YAML file at `path` if given, then by `TEMPORA_*` environment
    /// variables (`__` separates nested keys, e.g. `TEMPORA_BATCH__WORKERS=8`).
    pub fn load(path: Option<&Path>) -> Result<Self, eyre::Report> {
        let mut figment = Figment::new().merge(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("TEMPORA_").split("__"))
            .extract::<EngineConfig>()
            .map_err(|e| eyre!("Failed to parse engine configuration from {:?}: {}", path, e))
    }
}
