// Copyright 2024, The Tremor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::batcher::BatchLimits;
use crate::errors::{Error, Result};
use crate::executor::RetryPolicy;
use crate::record::TableId;
use serde::Deserialize;
use simd_json::prelude::*;
use simd_json::OwnedValue;
use std::collections::HashMap;
use std::time::Duration;

/// What happens to a batch that can not be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// fail the task, the offsets of the batch are never committed
    #[default]
    Halt,
    /// write the records to the dead-letter sink and commit their offsets
    DeadLetter,
}

/// Sink configuration, all durations are in nanoseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// alias used in log messages
    #[serde(default = "default_name")]
    pub name: String,
    /// GCP project id
    pub project: String,
    /// default dataset
    pub dataset: String,
    /// `INLINE_JSON`, `FILE_PATH` or `AMBIENT_DEFAULT`
    #[serde(default = "default_key_source")]
    pub key_source: String,
    /// credential json or path, depending on `key_source`
    #[serde(default)]
    pub key: Option<String>,
    /// storage write API or legacy `insertAll`
    #[serde(default = "default_true")]
    pub use_storage_write_api: bool,
    /// topic to `table`, `dataset.table` or `project.dataset.table`
    #[serde(default)]
    pub table_mapping: HashMap<String, String>,
    /// records per batch
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
    /// bytes per batch
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// age after which a batch is sealed
    #[serde(default = "default_max_batch_age")]
    pub max_batch_age: u64,
    /// how often batches are checked for their age
    #[serde(default = "default_tick_interval")]
    pub tick_interval: u64,
    /// sealed batches waiting per table before `put` blocks
    #[serde(default = "default_max_queued_batches")]
    pub max_queued_batches: usize,
    /// timeout for opening write sessions
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,
    /// timeout for a single append
    #[serde(default = "default_timeout")]
    pub request_timeout: u64,
    /// maximum size of a single append request in bytes
    #[serde(default = "default_request_size_limit")]
    pub request_size_limit: usize,
    /// delay before the first retry
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: u64,
    /// upper bound for retry delays
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: u64,
    /// submissions per batch, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// randomize retry delays
    #[serde(default = "default_true")]
    pub retry_jitter: bool,
    /// how long `stop` waits for outstanding submissions
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// handling of undeliverable batches
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// json lines file for the `dead_letter` policy
    #[serde(default)]
    pub dead_letter_path: Option<String>,
    /// base url of the `insertAll` API
    #[serde(default = "default_legacy_endpoint")]
    pub legacy_endpoint: String,
}

fn default_name() -> String {
    "gbq".to_string()
}

fn default_key_source() -> String {
    "AMBIENT_DEFAULT".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_batch_records() -> usize {
    500
}

fn default_max_batch_bytes() -> usize {
    // 5MB
    5 * 1024 * 1024
}

fn default_max_batch_age() -> u64 {
    1_000_000_000
}

fn default_tick_interval() -> u64 {
    100_000_000
}

fn default_max_queued_batches() -> usize {
    4
}

fn default_timeout() -> u64 {
    10_000_000_000
}

fn default_request_size_limit() -> usize {
    // 10MB
    10 * 1024 * 1024
}

fn default_retry_base_delay() -> u64 {
    100_000_000
}

fn default_retry_max_delay() -> u64 {
    10_000_000_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_shutdown_timeout() -> u64 {
    30_000_000_000
}

fn default_legacy_endpoint() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

// keys handed to the task as plain strings
const STRING_KEYS: [&str; 8] = [
    "name",
    "project",
    "dataset",
    "key_source",
    "key",
    "error_policy",
    "dead_letter_path",
    "legacy_endpoint",
];

impl Config {
    /// Deserializes the config from a structured value
    ///
    /// # Errors
    /// if the value does not describe a valid config
    pub fn new(config: &OwnedValue) -> Result<Self> {
        let config: Self = simd_json::serde::from_owned_value(config.clone())
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the config from the flat properties a task is started with.
    ///
    /// Numbers and booleans are parsed, `table_mapping` is given as `topic=table,...`.
    /// Keys of the host framework (`topics` and every key containing a `.`) are ignored.
    ///
    /// # Errors
    /// if the properties do not describe a valid config
    pub fn from_props(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = OwnedValue::object();
        for (key, value) in props {
            if key == "topics" || key.contains('.') {
                continue;
            }
            let value = if key == "table_mapping" {
                parse_mapping(value)?
            } else if STRING_KEYS.contains(&key.as_str()) {
                OwnedValue::from(value.as_str())
            } else {
                parse_scalar(value)
            };
            config.try_insert(key.clone(), value);
        }
        Self::new(&config)
    }

    /// Rejects zero limits and inconsistent settings
    ///
    /// # Errors
    /// with the first problem found
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_batch_records", self.max_batch_records as u64),
            ("max_batch_bytes", self.max_batch_bytes as u64),
            ("max_batch_age", self.max_batch_age),
            ("tick_interval", self.tick_interval),
            ("max_queued_batches", self.max_queued_batches as u64),
            ("request_size_limit", self.request_size_limit as u64),
            ("max_attempts", u64::from(self.max_attempts)),
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidConfiguration(format!(
                "`{key}` must be greater than 0"
            )));
        }
        if self.project.is_empty() || self.dataset.is_empty() {
            return Err(Error::InvalidConfiguration(
                "`project` and `dataset` must not be empty".to_string(),
            ));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::InvalidConfiguration(
                "`retry_base_delay` must not exceed `retry_max_delay`".to_string(),
            ));
        }
        for topic in self.table_mapping.keys() {
            self.table_for(topic)?;
        }
        if self.dead_letter_path.is_some() && self.error_policy == ErrorPolicy::Halt {
            warn!(
                "[{}] `dead_letter_path` is ignored with the `halt` error policy",
                self.name
            );
        }
        Ok(())
    }

    /// The destination table for records of `topic`
    ///
    /// # Errors
    /// if the mapping for the topic is not a valid table reference
    pub fn table_for(&self, topic: &str) -> Result<TableId> {
        match self.table_mapping.get(topic) {
            Some(reference) => TableId::parse(reference, &self.project, &self.dataset)
                .map_err(Error::InvalidConfiguration),
            None => Ok(TableId::new(
                self.project.as_str(),
                self.dataset.as_str(),
                TableId::sanitize(topic),
            )),
        }
    }

    /// batch thresholds
    #[must_use]
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_records: self.max_batch_records,
            max_bytes: self.max_batch_bytes,
            max_age: Duration::from_nanos(self.max_batch_age),
        }
    }

    /// retry settings
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_nanos(self.retry_base_delay),
            max_delay: Duration::from_nanos(self.retry_max_delay),
            max_attempts: self.max_attempts,
            jitter: self.retry_jitter,
        }
    }
}

fn parse_mapping(value: &str) -> Result<OwnedValue> {
    let mut mapping = OwnedValue::object();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((topic, table)) if !topic.trim().is_empty() && !table.trim().is_empty() => {
                mapping.try_insert(topic.trim().to_string(), table.trim());
            }
            _ => {
                return Err(Error::InvalidConfiguration(format!(
                    "Invalid `table_mapping` entry '{pair}', expected `topic=table`"
                )))
            }
        }
    }
    Ok(mapping)
}

fn parse_scalar(value: &str) -> OwnedValue {
    let mut bytes = value.trim().as_bytes().to_vec();
    match simd_json::to_owned_value(&mut bytes) {
        Ok(parsed @ OwnedValue::Static(_)) => parsed,
        _ => OwnedValue::from(value),
    }
}
