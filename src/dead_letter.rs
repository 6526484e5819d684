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

use crate::batcher::SealedBatch;
use crate::errors::Undeliverable;
use serde::Serialize;
use simd_json::OwnedValue;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Destination for the records of undeliverable batches under the `dead_letter` error policy
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Takes over every record of `batch`, once this returns `Ok` the records count as handled
    ///
    /// # Errors
    /// if the records could not be stored
    async fn route(&self, batch: &SealedBatch, failure: &Undeliverable) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct Entry<'batch> {
    table: String,
    topic: &'batch str,
    partition: i32,
    offset: i64,
    attempts: u32,
    cause: &'batch str,
    row: OwnedValue,
}

/// Appends one json line per record to a file
pub struct JsonLinesDeadLetter {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesDeadLetter {
    /// the file is created on the first routed batch
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// the file records are written to
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for JsonLinesDeadLetter {
    async fn route(&self, batch: &SealedBatch, failure: &Undeliverable) -> anyhow::Result<()> {
        let table = batch.table().to_string();
        let mut data = Vec::with_capacity(batch.bytes() * 2);
        for record in batch.records() {
            let offset = record.offset();
            let entry = Entry {
                table: table.clone(),
                topic: &offset.partition.topic,
                partition: offset.partition.partition,
                offset: offset.offset,
                attempts: failure.attempts,
                cause: &failure.cause,
                row: record.to_json(),
            };
            data.append(&mut simd_json::to_vec(&entry)?);
            data.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&data).await?;
            file.flush().await?;
        }
        warn!(
            "[{table}] {} record(s) of batch {} written to dead-letter file {}",
            batch.len(),
            batch.id(),
            self.path.display()
        );
        Ok(())
    }
}
