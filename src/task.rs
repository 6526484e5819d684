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

//! The sink task as driven by the host framework.
//!
//! ```text
//! STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED
//! ```
//!
//! A failed start returns to `STOPPED`. `put`, `flush` and `pre_commit` are only accepted
//! while `RUNNING`, `stop` is accepted in every state and does nothing when already stopped.

use crate::client::legacy::InsertAllFactory;
use crate::client::pool::WriteClientPool;
use crate::client::storage::{StorageWriteFactory, TonicChannelFactory};
use crate::client::SessionFactory;
use crate::config::{Config, ErrorPolicy};
use crate::credentials::{self, Credential};
use crate::dead_letter::{DeadLetterSink, JsonLinesDeadLetter};
use crate::dispatcher::{Delivery, Dispatcher, DispatcherConfig};
use crate::errors::{Error, Result, Undeliverable};
use crate::executor::SubmissionResult;
use crate::offsets::OffsetTracker;
use crate::quiescence::QuiescenceBeacon;
use crate::record::{Record, SourceOffset, TopicPartition};
use simd_json::OwnedValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tonic::transport::Channel;

/// Lifecycle state of a [`SinkTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// not started, or stopped
    Stopped,
    /// `start` in progress
    Starting,
    /// accepting records
    Running,
    /// `stop` in progress
    Stopping,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// A record as handed over by the host
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    /// topic the record was read from
    pub topic: String,
    /// partition within the topic
    pub partition: i32,
    /// offset within the partition
    pub offset: i64,
    /// record timestamp in nanoseconds since the epoch
    pub timestamp: Option<u64>,
    /// the record, every top level key becomes a column
    pub value: OwnedValue,
}

impl SinkRecord {
    /// creates a record without a timestamp
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: OwnedValue) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp: None,
            value,
        }
    }
}

struct Running {
    config: Config,
    pool: Arc<WriteClientPool>,
    dispatcher: Arc<Dispatcher>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    ticker: JoinHandle<()>,
    beacon: QuiescenceBeacon,
    offsets: OffsetTracker,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    // first undeliverable batch under the `halt` policy
    failure: Option<Undeliverable>,
}

impl Running {
    /// Applies the outcome of every delivery reported so far, never waits
    async fn process_deliveries(&mut self) {
        while let Ok(delivery) = self.deliveries.try_recv() {
            self.process(delivery).await;
        }
    }

    async fn process(&mut self, delivery: Delivery) {
        let Delivery { batch, result } = delivery;
        let (reason, attempts) = match result {
            SubmissionResult::Success(_) => {
                self.offsets
                    .complete(batch.records().iter().map(Record::offset));
                return;
            }
            SubmissionResult::RetryableFailure { reason, attempt } => (reason, attempt),
            SubmissionResult::FatalFailure { reason, attempts } => (reason, attempts),
        };
        let failure = Undeliverable {
            batch: batch.id(),
            table: batch.table().clone(),
            attempts,
            cause: reason.to_string(),
        };
        if let Some(dead_letter) = &self.dead_letter {
            match dead_letter.route(&batch, &failure).await {
                Ok(()) => {
                    self.offsets
                        .complete(batch.records().iter().map(Record::offset));
                    return;
                }
                Err(e) => {
                    error!(
                        "[{}] Failed to route batch {} to the dead-letter sink: {e}",
                        self.config.name,
                        batch.id()
                    );
                }
            }
        }
        error!("[{}] {failure}", self.config.name);
        self.failure.get_or_insert(failure);
    }

    fn check(&self) -> Result<()> {
        match &self.failure {
            Some(failure) => Err(Error::Undeliverable(failure.clone())),
            None => Ok(()),
        }
    }
}

/// A sink task streaming records into BigQuery
pub struct SinkTask {
    state: State,
    session_factory: Option<Arc<dyn SessionFactory>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    running: Option<Running>,
}

impl Default for SinkTask {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkTask {
    /// creates a stopped task
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Stopped,
            session_factory: None,
            dead_letter: None,
            running: None,
        }
    }

    /// Write sessions are opened through `factory` instead of the BigQuery clients selected by
    /// the config. Credentials are still resolved on `start`.
    #[must_use]
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = Some(factory);
        self
    }

    /// Undeliverable batches are routed to `sink` under the `dead_letter` error policy,
    /// instead of the file at `dead_letter_path`.
    #[must_use]
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// current lifecycle state
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// the version of this sink
    #[must_use]
    pub fn version(&self) -> &'static str {
        crate::version()
    }

    /// Starts the task from the host's properties
    ///
    /// # Errors
    /// if the task is not stopped, the config is invalid, no credential can be resolved or the
    /// warehouse rejects the connection. The task stays stopped.
    pub async fn start(&mut self, props: &HashMap<String, String>) -> Result<()> {
        self.expect_state("start", State::Stopped)?;
        match Config::from_props(props) {
            Ok(config) => self.start_with_config(config).await,
            Err(e) => {
                error!("Invalid sink configuration: {e}");
                Err(e)
            }
        }
    }

    /// Starts the task from a parsed config
    ///
    /// # Errors
    /// see [`SinkTask::start`]
    pub async fn start_with_config(&mut self, config: Config) -> Result<()> {
        self.expect_state("start", State::Stopped)?;
        self.state = State::Starting;
        info!("[{}] Starting", config.name);
        let name = config.name.clone();
        match self.connect(config).await {
            Ok(running) => {
                self.running = Some(running);
                self.state = State::Running;
                info!("[{name}] Running");
                Ok(())
            }
            Err(e) => {
                error!("[{name}] Failed to start: {e}");
                self.state = State::Stopped;
                Err(e)
            }
        }
    }

    async fn connect(&self, config: Config) -> Result<Running> {
        config.validate()?;
        let scopes = credentials::required_scopes(config.use_storage_write_api);
        let credential = credentials::resolve(&config.key_source, config.key.as_deref(), &scopes)?;
        debug!(
            "[{}] Resolved {:?} credential with scopes {:?}",
            config.name,
            credential.kind(),
            credential.scopes()
        );

        let dead_letter = match config.error_policy {
            ErrorPolicy::Halt => None,
            ErrorPolicy::DeadLetter => match (&self.dead_letter, &config.dead_letter_path) {
                (Some(sink), _) => Some(sink.clone()),
                (None, Some(path)) => {
                    Some(Arc::new(JsonLinesDeadLetter::new(path)) as Arc<dyn DeadLetterSink>)
                }
                (None, None) => {
                    return Err(Error::InvalidConfiguration(
                        "the `dead_letter` error policy requires `dead_letter_path`".to_string(),
                    ))
                }
            },
        };

        let factory = match &self.session_factory {
            Some(factory) => factory.clone(),
            None => session_factory(&config, credential)?,
        };
        let pool = Arc::new(WriteClientPool::connect(factory).await?);

        let beacon = QuiescenceBeacon::default();
        let (dispatcher, deliveries) = Dispatcher::new(
            pool.clone(),
            DispatcherConfig {
                limits: config.batch_limits(),
                retry: config.retry_policy(),
                request_size_limit: config.request_size_limit,
                max_queued_batches: config.max_queued_batches,
            },
            beacon.clone(),
        );
        let dispatcher = Arc::new(dispatcher);
        let ticker = dispatcher.spawn_ticker(Duration::from_nanos(config.tick_interval));

        Ok(Running {
            config,
            pool,
            dispatcher,
            deliveries,
            ticker,
            beacon,
            offsets: OffsetTracker::new(),
            dead_letter,
            failure: None,
        })
    }

    /// Queues records for delivery, waiting while the queue of a destination table is full
    ///
    /// # Errors
    /// if the task is not running, a previous batch was undeliverable under the `halt` policy
    /// or a record can not be converted into a row
    pub async fn put(&mut self, records: Vec<SinkRecord>) -> Result<()> {
        let running = self.running_mut("put")?;
        running.process_deliveries().await;
        running.check()?;
        for record in records {
            let table = running.config.table_for(&record.topic)?;
            let offset = SourceOffset::new(record.topic, record.partition, record.offset);
            let ingestion_time = record.timestamp.unwrap_or_else(now_nanos);
            let row = Record::from_json(table, &record.value, offset.clone(), ingestion_time)
                .map_err(|e| Error::InvalidRecord(offset.clone(), e))?;
            running.offsets.track(&offset);
            running.dispatcher.append(row).await?;
        }
        running.process_deliveries().await;
        Ok(())
    }

    /// Seals every open batch regardless of its thresholds
    ///
    /// # Errors
    /// if the task is not running or a previous batch was undeliverable under the `halt` policy
    pub async fn flush(&mut self) -> Result<()> {
        let running = self.running_mut("flush")?;
        running.process_deliveries().await;
        running.check()?;
        running.dispatcher.flush().await
    }

    /// The next offset to consume per topic-partition, everything before it was delivered
    ///
    /// # Errors
    /// if the task is not running or a batch was undeliverable under the `halt` policy
    pub async fn pre_commit(&mut self) -> Result<HashMap<TopicPartition, i64>> {
        let running = self.running_mut("pre_commit")?;
        running.process_deliveries().await;
        running.check()?;
        Ok(running.offsets.committable())
    }

    /// Stops the task: cancels pending retries, flushes, waits up to `shutdown_timeout` for
    /// outstanding submissions and closes the write sessions. Submissions still running at
    /// the deadline are aborted and reported as undeliverable.
    ///
    /// Stopping a stopped task does nothing.
    ///
    /// # Errors
    /// if write sessions could not be closed cleanly, the task is stopped regardless
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            self.state = State::Stopped;
            return Ok(());
        };
        self.state = State::Stopping;
        let name = running.config.name.clone();
        info!("[{name}] Stopping");
        let deadline = Instant::now() + Duration::from_nanos(running.config.shutdown_timeout);

        running.beacon.drain();
        running.ticker.abort();
        running.dispatcher.flush_until(deadline).await;
        running.dispatcher.close(deadline).await;
        running.process_deliveries().await;
        let pending = running.offsets.pending();
        if pending > 0 {
            warn!("[{name}] {pending} record(s) were not delivered");
        }

        let res = running
            .pool
            .shutdown(deadline.saturating_duration_since(Instant::now()))
            .await;
        self.state = State::Stopped;
        info!("[{name}] Stopped");
        res.map_err(Error::from)
    }

    fn expect_state(&self, operation: &'static str, expected: State) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn running_mut(&mut self, operation: &'static str) -> Result<&mut Running> {
        self.expect_state(operation, State::Running)?;
        let state = self.state;
        self.running
            .as_mut()
            .ok_or(Error::InvalidState { operation, state })
    }
}

fn session_factory(config: &Config, credential: Credential) -> Result<Arc<dyn SessionFactory>> {
    let connect_timeout = Duration::from_nanos(config.connect_timeout);
    let request_timeout = Duration::from_nanos(config.request_timeout);
    if config.use_storage_write_api {
        Ok(Arc::new(StorageWriteFactory::<
            Credential,
            Channel,
            tonic::transport::Error,
        >::new(
            credential,
            Box::new(TonicChannelFactory),
            connect_timeout,
            request_timeout,
        )
        .with_quota_project(&config.project)))
    } else {
        Ok(Arc::new(
            InsertAllFactory::new(
                credential,
                &config.legacy_endpoint,
                connect_timeout,
                request_timeout,
            )?
            .with_quota_project(&config.project),
        ))
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}
