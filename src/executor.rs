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
use crate::client::pool::WriteClientPool;
use crate::client::AckToken;
use crate::errors::{ClientError, FailureKind, WriteError};
use crate::quiescence::QuiescenceBeacon;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// Exponential backoff settings for failed submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// delay before the first retry
    pub base_delay: Duration,
    /// upper bound for any delay
    pub max_delay: Duration,
    /// submissions per batch, including the first one
    pub max_attempts: u32,
    /// randomize each delay within `[d/2, d]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// The delay after the failed submission number `attempt` (starting at 1) before jitter:
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Backoff state of a single worker
struct Backoff {
    policy: RetryPolicy,
    random: Option<SmallRng>,
}

impl Backoff {
    fn new(policy: RetryPolicy) -> Self {
        let random = if policy.jitter {
            Some(SmallRng::from_entropy())
        } else {
            None
        };
        Self { policy, random }
    }

    fn wait_time(&mut self, attempt: u32) -> Duration {
        let ceiling = self.policy.ceiling(attempt);
        if let Some(prng) = self.random.as_mut() {
            let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
            Duration::from_nanos(prng.gen_range(nanos / 2..=nanos))
        } else {
            ceiling
        }
    }
}

/// Outcome of submitting a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    /// every record of the batch was acknowledged
    Success(AckToken),
    /// the attempt failed but may succeed when retried
    RetryableFailure {
        /// the failure
        reason: WriteError,
        /// the attempt that failed, starting at 1
        attempt: u32,
    },
    /// the batch can not be delivered
    FatalFailure {
        /// the last failure
        reason: WriteError,
        /// number of submissions performed
        attempts: u32,
    },
}

/// What was already achieved for a batch across attempts
#[derive(Debug, Default)]
pub struct Progress {
    attempts: u32,
    acknowledged: usize,
    first_ack: Option<AckToken>,
}

impl Progress {
    /// submissions performed so far
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// records of the batch acknowledged so far
    #[must_use]
    pub fn acknowledged(&self) -> usize {
        self.acknowledged
    }
}

fn client_failure(e: &ClientError) -> WriteError {
    let kind = match e {
        ClientError::Channel(_) | ClientError::Connect { .. } => FailureKind::Transport,
        ClientError::AuthenticationRejected(_) => FailureKind::PermissionDenied,
        ClientError::SchemaNotProvided(_) => FailureKind::SchemaMismatch,
        ClientError::Close { .. } | ClientError::PoolClosed | ClientError::Shutdown(_) => {
            FailureKind::Rejected
        }
    };
    WriteError::new(kind, e.to_string())
}

/// Splits rows into requests of at most `limit` bytes, a single larger row gets its own request
fn split(rows: Vec<Vec<u8>>, limit: usize) -> Vec<Vec<Vec<u8>>> {
    let mut requests = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for row in rows {
        if !current.is_empty() && size + row.len() > limit {
            requests.push(std::mem::take(&mut current));
            size = 0;
        }
        size += row.len();
        current.push(row);
    }
    if !current.is_empty() {
        requests.push(current);
    }
    requests
}

/// Submits sealed batches through the pool and retries them with backoff
pub struct WriteExecutor {
    pool: Arc<WriteClientPool>,
    backoff: Backoff,
    request_size_limit: usize,
    beacon: QuiescenceBeacon,
}

impl WriteExecutor {
    /// creates a new executor, every submission worker owns one
    #[must_use]
    pub fn new(
        pool: Arc<WriteClientPool>,
        policy: RetryPolicy,
        request_size_limit: usize,
        beacon: QuiescenceBeacon,
    ) -> Self {
        Self {
            pool,
            backoff: Backoff::new(policy),
            request_size_limit,
            beacon,
        }
    }

    /// Submits the batch until it is acknowledged, fails fatally or runs out of attempts.
    ///
    /// Never returns `SubmissionResult::RetryableFailure`.
    pub async fn submit(&mut self, batch: &SealedBatch) -> SubmissionResult {
        let table = batch.table();
        let max_attempts = self.backoff.policy.max_attempts.max(1);
        let mut progress = Progress::default();
        loop {
            let result = tokio::select! {
                biased;
                () = self.beacon.stopped() => {
                    let reason = WriteError::transport("submission aborted by shutdown");
                    error!("[{table}] Batch {} abandoned after {} attempt(s): {reason}", batch.id(), progress.attempts);
                    return SubmissionResult::FatalFailure { reason, attempts: progress.attempts };
                }
                result = self.attempt(batch, &mut progress) => result,
            };
            match result {
                SubmissionResult::Success(ack) => {
                    debug!(
                        "[{table}] Batch {} with {} record(s) acknowledged after {} attempt(s)",
                        batch.id(),
                        batch.len(),
                        progress.attempts
                    );
                    return SubmissionResult::Success(ack);
                }
                SubmissionResult::RetryableFailure { reason, attempt } => {
                    if attempt >= max_attempts {
                        error!("[{table}] Batch {} failed after {attempt} attempt(s): {reason}", batch.id());
                        return SubmissionResult::FatalFailure {
                            reason,
                            attempts: attempt,
                        };
                    }
                    if !self.beacon.continue_retrying() {
                        error!("[{table}] Batch {} not retried while stopping: {reason}", batch.id());
                        return SubmissionResult::FatalFailure {
                            reason,
                            attempts: attempt,
                        };
                    }
                    let wait = self.backoff.wait_time(attempt);
                    warn!(
                        "[{table}] Batch {} attempt {attempt}/{max_attempts} failed, retrying in {}ms: {reason}",
                        batch.id(),
                        wait.as_millis()
                    );
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = self.beacon.draining() => {
                            error!("[{table}] Batch {} backoff cancelled by shutdown: {reason}", batch.id());
                            return SubmissionResult::FatalFailure { reason, attempts: attempt };
                        }
                    }
                }
                SubmissionResult::FatalFailure { reason, attempts } => {
                    error!("[{table}] Batch {} failed after {attempts} attempt(s): {reason}", batch.id());
                    return SubmissionResult::FatalFailure { reason, attempts };
                }
            }
        }
    }

    /// Performs a single submission, skipping the records already acknowledged in `progress`
    pub async fn attempt(&self, batch: &SealedBatch, progress: &mut Progress) -> SubmissionResult {
        progress.attempts += 1;
        let attempt = progress.attempts;
        let table = batch.table();

        let mut handle = match self.pool.acquire(table).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = client_failure(&e);
                return if e.is_retryable() {
                    SubmissionResult::RetryableFailure { reason, attempt }
                } else {
                    SubmissionResult::FatalFailure {
                        reason,
                        attempts: attempt,
                    }
                };
            }
        };

        let encoded: Result<Vec<Vec<u8>>, WriteError> = batch.records()[progress.acknowledged..]
            .iter()
            .map(|record| handle.encode(record))
            .collect();
        let rows = match encoded {
            Ok(rows) => rows,
            Err(reason) => {
                self.pool.release(handle);
                return SubmissionResult::FatalFailure {
                    reason,
                    attempts: attempt,
                };
            }
        };

        let requests = split(rows, self.request_size_limit);
        if requests.len() > 1 {
            warn!("[{table}] Batch {} is too large to be sent in a single request, splitting it into {} requests. Consider lowering the batch size.", batch.id(), requests.len());
        }
        for request in requests {
            match handle.append(&request).await {
                Ok(ack) => {
                    progress.acknowledged += request.len();
                    progress.first_ack.get_or_insert(ack);
                }
                Err(reason) => {
                    if reason.kind() == FailureKind::Transport {
                        handle.invalidate().await;
                    } else {
                        self.pool.release(handle);
                    }
                    return if reason.is_retryable() {
                        SubmissionResult::RetryableFailure { reason, attempt }
                    } else {
                        SubmissionResult::FatalFailure {
                            reason,
                            attempts: attempt,
                        }
                    };
                }
            }
        }
        self.pool.release(handle);

        let first = progress.first_ack.take();
        SubmissionResult::Success(AckToken {
            stream: first
                .as_ref()
                .map_or_else(|| table.to_string(), |a| a.stream.clone()),
            offset: first.and_then(|a| a.offset),
            rows: batch.len(),
        })
    }
}
