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

//! Per-table lanes between the batcher and the warehouse.
//!
//! Every destination table gets a lane: a bounded queue of sealed batches and a worker task
//! that submits them one after the other. A full queue blocks appends for its table only.
//!
//! Batches of a table are sealed and queued while holding the lane lock of that table, so
//! the order of batches in a lane is the order in which their records were appended.

use crate::batcher::{BatchLimits, RecordBatcher, SealedBatch};
use crate::client::pool::WriteClientPool;
use crate::errors::{Error, Result, WriteError};
use crate::executor::{RetryPolicy, SubmissionResult, WriteExecutor};
use crate::quiescence::QuiescenceBeacon;
use crate::record::{Record, TableId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// time given to workers to report their batches after a full stop
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// The outcome of a submitted batch
#[derive(Debug)]
pub struct Delivery {
    /// the batch
    pub batch: SealedBatch,
    /// what happened to it
    pub result: SubmissionResult,
}

/// Dispatcher settings
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// batch thresholds
    pub limits: BatchLimits,
    /// retry settings for every worker
    pub retry: RetryPolicy,
    /// maximum size of a single append request
    pub request_size_limit: usize,
    /// sealed batches queued per table
    pub max_queued_batches: usize,
}

struct Lane {
    // `None` once the dispatcher is closed
    sender: Mutex<Option<mpsc::Sender<SealedBatch>>>,
}

/// Routes records into batches and sealed batches to their table's worker
pub struct Dispatcher {
    batcher: Mutex<RecordBatcher>,
    lanes: DashMap<TableId, Arc<Lane>>,
    workers: DashMap<TableId, JoinHandle<()>>,
    pool: Arc<WriteClientPool>,
    config: DispatcherConfig,
    beacon: QuiescenceBeacon,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Dispatcher {
    /// Creates a dispatcher, the outcome of every sealed batch is sent to the returned receiver
    #[must_use]
    pub fn new(
        pool: Arc<WriteClientPool>,
        config: DispatcherConfig,
        beacon: QuiescenceBeacon,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        (
            Self {
                batcher: Mutex::new(RecordBatcher::new(config.limits)),
                lanes: DashMap::new(),
                workers: DashMap::new(),
                pool,
                config,
                beacon,
                deliveries,
            },
            rx,
        )
    }

    fn lane(&self, table: &TableId) -> Arc<Lane> {
        self.lanes
            .entry(table.clone())
            .or_insert_with(|| self.spawn_lane(table))
            .value()
            .clone()
    }

    fn spawn_lane(&self, table: &TableId) -> Arc<Lane> {
        let (tx, mut rx) = mpsc::channel::<SealedBatch>(self.config.max_queued_batches.max(1));
        let mut executor = WriteExecutor::new(
            self.pool.clone(),
            self.config.retry,
            self.config.request_size_limit,
            self.beacon.clone(),
        );
        let beacon = self.beacon.clone();
        let deliveries = self.deliveries.clone();
        let worker_table = table.clone();
        let worker = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let result = if beacon.is_stopped() {
                    SubmissionResult::FatalFailure {
                        reason: WriteError::transport("submission aborted by shutdown"),
                        attempts: 0,
                    }
                } else {
                    executor.submit(&batch).await
                };
                if deliveries.send(Delivery { batch, result }).is_err() {
                    error!("[{worker_table}] Delivery receiver is gone, stopping worker");
                    break;
                }
            }
            debug!("[{worker_table}] Submission worker stopped");
        });
        self.workers.insert(table.clone(), worker);
        debug!("[{table}] Submission worker started");
        Arc::new(Lane {
            sender: Mutex::new(Some(tx)),
        })
    }

    /// Appends a record, waiting while the queue of its table is full
    ///
    /// # Errors
    /// if the worker for the table is gone
    pub async fn append(&self, record: Record) -> Result<()> {
        let table = record.table().clone();
        let lane = self.lane(&table);
        let sender = lane.sender.lock().await;
        let sealed = self.batcher.lock().await.append(record);
        if let Some(batch) = sealed {
            let tx = sender.as_ref().ok_or_else(|| Error::WorkerGone(table.clone()))?;
            tx.send(batch)
                .await
                .map_err(|_| Error::WorkerGone(table.clone()))?;
        }
        Ok(())
    }

    /// Seals the batches that reached their maximum age.
    ///
    /// Never waits: tables that are busy or whose queue is full are picked up by a later tick.
    pub async fn tick(&self, now: Instant) {
        let expired = self.batcher.lock().await.expired(now);
        for table in expired {
            let lane = self.lane(&table);
            let Ok(sender) = lane.sender.try_lock() else {
                continue;
            };
            let Some(Ok(permit)) = sender.as_ref().map(mpsc::Sender::try_reserve) else {
                continue;
            };
            if let Some(batch) = self.batcher.lock().await.seal_expired(&table, now) {
                permit.send(batch);
            }
        }
    }

    /// Seals and queues every open batch, waiting for queue capacity
    ///
    /// # Errors
    /// if the worker of a table is gone
    pub async fn flush(&self) -> Result<()> {
        let tables: Vec<TableId> = self
            .lanes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for table in tables {
            let lane = self.lane(&table);
            let sender = lane.sender.lock().await;
            let sealed = self.batcher.lock().await.flush(&table);
            if let Some(batch) = sealed {
                let tx = sender.as_ref().ok_or_else(|| Error::WorkerGone(table.clone()))?;
                tx.send(batch)
                    .await
                    .map_err(|_| Error::WorkerGone(table.clone()))?;
            }
        }
        Ok(())
    }

    /// Seals and queues every open batch like `flush`, but never waits past `deadline`.
    ///
    /// A batch that can not be queued by then is reported as failed and outstanding
    /// submissions are aborted through a full stop.
    pub async fn flush_until(&self, deadline: Instant) {
        let tables: Vec<TableId> = self
            .lanes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for table in tables {
            let lane = self.lane(&table);
            let sender = timeout_at(deadline, lane.sender.lock()).await.ok();
            if self.batcher.lock().await.open_records(&table) == 0 {
                continue;
            }
            let permit = match sender.as_deref().and_then(Option::as_ref) {
                Some(tx) if !self.beacon.is_stopped() => {
                    timeout_at(deadline, tx.reserve()).await.ok().and_then(std::result::Result::ok)
                }
                _ => None,
            };
            let Some(batch) = self.batcher.lock().await.flush(&table) else {
                continue;
            };
            if let Some(permit) = permit {
                permit.send(batch);
                continue;
            }
            if !self.beacon.is_stopped() {
                warn!("[{table}] Shutdown deadline reached while flushing, aborting submissions");
                self.beacon.full_stop();
            }
            let result = SubmissionResult::FatalFailure {
                reason: WriteError::transport("not queued before the shutdown deadline"),
                attempts: 0,
            };
            if self.deliveries.send(Delivery { batch, result }).is_err() {
                error!("[{table}] Delivery receiver is gone, dropping batch");
            }
        }
    }

    /// records in the open batch of `table`
    pub async fn open_records(&self, table: &TableId) -> usize {
        self.batcher.lock().await.open_records(table)
    }

    /// Stops accepting batches and waits until `deadline` for the workers to finish their
    /// queues. At the deadline outstanding submissions are aborted through a full stop and
    /// reported as failed, workers that still do not finish are cancelled.
    pub async fn close(&self, deadline: Instant) {
        let lanes: Vec<Arc<Lane>> = self.lanes.iter().map(|e| e.value().clone()).collect();
        for lane in lanes {
            lane.sender.lock().await.take();
        }
        let tables: Vec<TableId> = self.workers.iter().map(|e| e.key().clone()).collect();
        let mut workers: Vec<(TableId, JoinHandle<()>)> = tables
            .into_iter()
            .filter_map(|table| self.workers.remove(&table))
            .collect();

        let mut remaining = Vec::new();
        for (table, mut worker) in workers.drain(..) {
            if timeout_at(deadline, &mut worker).await.is_err() {
                remaining.push((table, worker));
            }
        }
        if remaining.is_empty() {
            return;
        }
        warn!(
            "{} submission worker(s) still busy at the shutdown deadline, aborting",
            remaining.len()
        );
        self.beacon.full_stop();
        let grace = Instant::now() + ABORT_GRACE;
        for (table, mut worker) in remaining {
            if timeout_at(grace, &mut worker).await.is_err() {
                error!("[{table}] Submission worker did not stop, cancelling it");
                worker.abort();
            }
        }
    }

    /// Runs `tick` every `every` until the beacon starts draining
    #[must_use]
    pub fn spawn_ticker(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let dispatcher = Arc::downgrade(self);
        let beacon = self.beacon.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = beacon.draining() => break,
                }
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                dispatcher.tick(Instant::now()).await;
            }
        })
    }
}
