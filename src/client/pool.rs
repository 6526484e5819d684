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

use super::{AckToken, SessionFactory, WriteSession};
use crate::errors::{ClientError, WriteError};
use crate::record::{Record, TableId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout_at, Instant};

#[derive(Default)]
struct Slot {
    session: Option<Box<dyn WriteSession>>,
}

/// Owns one write session per destination table.
///
/// Sessions are opened lazily on the first `acquire` for a table and reused afterwards. Every
/// table has its own lock, so a submission in flight for one table never delays another.
pub struct WriteClientPool {
    factory: Arc<dyn SessionFactory>,
    slots: DashMap<TableId, Arc<Mutex<Slot>>>,
    closed: AtomicBool,
}

impl WriteClientPool {
    /// Performs the handshake and creates the pool
    ///
    /// # Errors
    /// if the handshake fails
    pub async fn connect(factory: Arc<dyn SessionFactory>) -> Result<Self, ClientError> {
        factory.handshake().await?;
        Ok(Self {
            factory,
            slots: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Leases the session for `table`, waiting for any in-flight submission on it
    ///
    /// # Errors
    /// if the pool is closed or no session could be opened
    pub async fn acquire(&self, table: &TableId) -> Result<WriteClientHandle, ClientError> {
        if self.is_closed() {
            return Err(ClientError::PoolClosed);
        }
        // the map shard lock is released before we wait on the slot
        let slot = self
            .slots
            .entry(table.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .value()
            .clone();
        let mut guard = slot.lock_owned().await;
        if self.is_closed() {
            return Err(ClientError::PoolClosed);
        }
        let session = if let Some(session) = guard.session.take() {
            session
        } else {
            let session = self.factory.open(table).await?;
            info!("[{table}] Write session opened");
            session
        };
        Ok(WriteClientHandle {
            table: table.clone(),
            guard,
            session,
        })
    }

    /// Returns a leased session to the pool for reuse
    pub fn release(&self, handle: WriteClientHandle) {
        let WriteClientHandle {
            mut guard, session, ..
        } = handle;
        guard.session = Some(session);
    }

    /// Waits up to `timeout` for in-flight submissions and closes every session.
    ///
    /// Later acquires fail with `ClientError::PoolClosed`, shutting down a closed pool does
    /// nothing.
    ///
    /// # Errors
    /// `ClientError::Shutdown` with every session that did not close cleanly
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let slots: Vec<(TableId, Arc<Mutex<Slot>>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.slots.clear();

        let mut errors = Vec::new();
        for (table, slot) in slots {
            match timeout_at(deadline, slot.lock_owned()).await {
                Ok(mut guard) => {
                    if let Some(mut session) = guard.session.take() {
                        match session.close().await {
                            Ok(()) => debug!("[{table}] Write session closed"),
                            Err(e) => errors.push(e),
                        }
                    }
                }
                Err(_) => errors.push(ClientError::Close {
                    table,
                    reason: "submission still in flight at the shutdown deadline".to_string(),
                }),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            for e in &errors {
                error!("Write client pool shutdown: {e}");
            }
            Err(ClientError::Shutdown(errors))
        }
    }

    /// true once `shutdown` was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A session leased from the pool, at most one exists per table at any time
pub struct WriteClientHandle {
    table: TableId,
    guard: OwnedMutexGuard<Slot>,
    session: Box<dyn WriteSession>,
}

impl WriteClientHandle {
    /// the table this session writes to
    #[must_use]
    pub fn table(&self) -> &TableId {
        &self.table
    }

    /// encodes a record with the session's encoder
    ///
    /// # Errors
    /// if the record does not fit the table
    pub fn encode(&self, record: &Record) -> Result<Vec<u8>, WriteError> {
        self.session.encode(record)
    }

    /// appends rows through the session
    ///
    /// # Errors
    /// the classified failure
    pub async fn append(&mut self, rows: &[Vec<u8>]) -> Result<AckToken, WriteError> {
        self.session.append(rows).await
    }

    /// Closes and drops the session, the next `acquire` for the table opens a new one
    pub async fn invalidate(self) {
        let Self {
            table,
            guard,
            mut session,
        } = self;
        if let Err(e) = session.close().await {
            warn!("[{table}] Failed to close invalidated write session: {e}");
        }
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{FakeFactory, FakeState};
    use tokio::time::timeout;

    async fn pool(state: FakeState) -> anyhow::Result<(WriteClientPool, FakeFactory)> {
        let factory = FakeFactory::new(state);
        let pool = WriteClientPool::connect(Arc::new(factory.clone())).await?;
        Ok((pool, factory))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sessions_are_opened_lazily_and_reused() -> anyhow::Result<()> {
        let (pool, factory) = pool(FakeState::default()).await?;
        assert_eq!(1, FakeState::count(&factory.state.handshakes));
        assert_eq!(0, FakeState::count(&factory.state.opened));

        let table = TableId::new("p", "d", "t");
        let handle = pool.acquire(&table).await?;
        assert_eq!(&table, handle.table());
        pool.release(handle);
        let handle = pool.acquire(&table).await?;
        pool.release(handle);
        assert_eq!(1, FakeState::count(&factory.state.opened));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_handshake_fails_connect() {
        let factory = FakeFactory::new(FakeState {
            reject_handshake: true,
            ..FakeState::default()
        });
        let res = WriteClientPool::connect(Arc::new(factory)).await;
        assert!(matches!(res, Err(ClientError::AuthenticationRejected(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tables_do_not_wait_on_each_other() -> anyhow::Result<()> {
        let (pool, _factory) = pool(FakeState::default()).await?;
        let a = TableId::new("p", "d", "a");
        let b = TableId::new("p", "d", "b");
        let held = pool.acquire(&a).await?;

        // a different table is available right away
        let other = timeout(Duration::from_millis(100), pool.acquire(&b)).await??;
        pool.release(other);

        // the same table waits for the lease to be returned
        assert!(timeout(Duration::from_millis(100), pool.acquire(&a))
            .await
            .is_err());
        pool.release(held);
        let again = timeout(Duration::from_millis(100), pool.acquire(&a)).await??;
        pool.release(again);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalidated_sessions_are_reopened() -> anyhow::Result<()> {
        let (pool, factory) = pool(FakeState::default()).await?;
        let table = TableId::new("p", "d", "t");
        pool.acquire(&table).await?.invalidate().await;
        assert_eq!(1, FakeState::count(&factory.state.closed));
        let handle = pool.acquire(&table).await?;
        pool.release(handle);
        assert_eq!(2, FakeState::count(&factory.state.opened));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_closes_everything_once() -> anyhow::Result<()> {
        let (pool, factory) = pool(FakeState::default()).await?;
        for t in ["a", "b", "c"] {
            let handle = pool.acquire(&TableId::new("p", "d", t)).await?;
            pool.release(handle);
        }
        pool.shutdown(Duration::from_secs(1)).await?;
        assert_eq!(3, FakeState::count(&factory.state.closed));
        assert!(pool.is_closed());

        // second shutdown is a no-op
        pool.shutdown(Duration::from_secs(1)).await?;
        assert_eq!(3, FakeState::count(&factory.state.closed));

        let res = pool.acquire(&TableId::new("p", "d", "a")).await;
        assert!(matches!(res, Err(ClientError::PoolClosed)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_aggregates_failures() -> anyhow::Result<()> {
        let (pool, _factory) = pool(FakeState {
            fail_close: true,
            ..FakeState::default()
        })
        .await?;
        for t in ["a", "b"] {
            let handle = pool.acquire(&TableId::new("p", "d", t)).await?;
            pool.release(handle);
        }
        // a lease that is never returned
        let held = pool.acquire(&TableId::new("p", "d", "c")).await?;

        match pool.shutdown(Duration::from_millis(100)).await {
            Err(ClientError::Shutdown(errors)) => {
                assert_eq!(3, errors.len());
                assert_eq!(
                    2,
                    errors
                        .iter()
                        .filter(|e| matches!(e, ClientError::Close { reason, .. } if reason == "snot"))
                        .count()
                );
            }
            other => panic!("unexpected shutdown result: {other:?}"),
        }
        drop(held);
        Ok(())
    }
}
