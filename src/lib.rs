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

//! Tremor Google BigQuery streaming sink
//!
//! A sink task that streams committed records from a log into BigQuery, either through the
//! storage write API (default) or the legacy `tabledata.insertAll` API.
//!
//! Records are batched per destination table, each table gets its own submission worker so a
//! slow table never stalls the others. Failed submissions are retried with exponential backoff,
//! batches that still can not be delivered halt the task or are routed to a dead-letter sink.
//!
//! ### Configuration
//!
//! | name                    | description                                                            | default              |
//! |-------------------------|------------------------------------------------------------------------|----------------------|
//! | `project`               | GCP project id                                                         |                      |
//! | `dataset`               | default dataset for tables                                             |                      |
//! | `key_source`            | `INLINE_JSON`, `FILE_PATH` or `AMBIENT_DEFAULT`                        | `AMBIENT_DEFAULT`    |
//! | `key`                   | inline credential json or path to the credential file                  |                      |
//! | `use_storage_write_api` | use the storage write API instead of `insertAll`                       | `true`               |
//! | `table_mapping`         | topic to table mapping                                                 | sanitized topic name |
//! | `max_batch_records`     | records per batch                                                      | `500`                |
//! | `max_batch_bytes`       | bytes per batch                                                        | `5MiB`               |
//! | `max_batch_age`         | maximum batch age in nanoseconds                                       | `1s`                 |
//! | `max_queued_batches`    | sealed batches queued per table before `put` blocks                    | `4`                  |
//! | `max_attempts`          | submissions per batch before it is considered undeliverable            | `5`                  |
//! | `error_policy`          | `halt` or `dead_letter`                                                | `halt`               |
//!
//! See [`config::Config`] for the complete list.

#![warn(missing_docs)]
#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::unnecessary_unwrap,
    clippy::pedantic,
    clippy::mod_module_files
)]

#[macro_use]
extern crate log;

/// Batching of records per destination table
pub mod batcher;
/// Write session adapters and the per-table session pool
pub mod client;
/// Sink configuration
pub mod config;
/// Credential resolution and scoping
pub mod credentials;
/// Dead-letter sinks for undeliverable batches
pub mod dead_letter;
/// Per-table submission queues and workers
pub mod dispatcher;
/// Error types
pub mod errors;
/// Batch submission and retry handling
pub mod executor;
/// Offset tracking for commits
pub mod offsets;
/// Shutdown signalling
pub mod quiescence;
/// Records and table identifiers
pub mod record;
/// The sink task lifecycle
pub mod task;

pub use crate::errors::{Error, Result};
pub use crate::task::{SinkRecord, SinkTask, State};

/// The version of this sink
#[must_use]
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
