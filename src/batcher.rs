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

use crate::record::{Record, TableId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Thresholds at which a batch is sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// seal once the batch holds this many records
    pub max_records: usize,
    /// seal once the accumulated size reaches this many bytes
    pub max_bytes: usize,
    /// seal once the first record in the batch is this old
    pub max_age: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: 500,
            max_bytes: 5 * 1024 * 1024,
            max_age: Duration::from_secs(1),
        }
    }
}

/// Why a batch was sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    /// record count threshold
    Records,
    /// byte size threshold
    Bytes,
    /// age threshold
    Age,
    /// explicit flush
    Flush,
}

struct Batch {
    records: Vec<Record>,
    bytes: usize,
    created: Instant,
}

impl Batch {
    fn new(created: Instant) -> Self {
        Self {
            records: Vec::new(),
            bytes: 0,
            created,
        }
    }

    fn push(&mut self, record: Record) {
        self.bytes += record.byte_size();
        self.records.push(record);
    }

    fn threshold(&self, limits: &BatchLimits, now: Instant) -> Option<SealReason> {
        if self.records.len() >= limits.max_records {
            Some(SealReason::Records)
        } else if self.bytes >= limits.max_bytes {
            Some(SealReason::Bytes)
        } else if now.saturating_duration_since(self.created) >= limits.max_age {
            Some(SealReason::Age)
        } else {
            None
        }
    }
}

/// A batch that reached one of its thresholds, ready to be written
#[derive(Debug, Clone)]
pub struct SealedBatch {
    id: u64,
    table: TableId,
    records: Vec<Record>,
    bytes: usize,
    created: Instant,
    reason: SealReason,
}

impl SealedBatch {
    /// unique (per batcher) and increasing id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// destination table
    #[must_use]
    pub fn table(&self) -> &TableId {
        &self.table
    }

    /// records in arrival order
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// true if the batch holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// accumulated size in bytes
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// when the first record arrived
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// the threshold that sealed this batch
    #[must_use]
    pub fn reason(&self) -> SealReason {
        self.reason
    }
}

/// Accumulates records per destination table and seals batches once they reach a threshold
pub struct RecordBatcher {
    limits: BatchLimits,
    open: HashMap<TableId, Batch>,
    next_id: u64,
}

impl RecordBatcher {
    /// creates a new batcher
    #[must_use]
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            open: HashMap::new(),
            next_id: 0,
        }
    }

    /// the configured thresholds
    #[must_use]
    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    /// Appends a record to the open batch of its table, returning the batch if it got sealed
    pub fn append(&mut self, record: Record) -> Option<SealedBatch> {
        self.append_at(record, Instant::now())
    }

    /// Like `append` with an explicit notion of now
    pub fn append_at(&mut self, record: Record, now: Instant) -> Option<SealedBatch> {
        let table = record.table().clone();
        let batch = self
            .open
            .entry(table.clone())
            .or_insert_with(|| Batch::new(now));
        batch.push(record);
        let reason = batch.threshold(&self.limits, now)?;
        self.seal(&table, reason)
    }

    /// Seals every batch that reached its maximum age
    pub fn tick(&mut self, now: Instant) -> Vec<SealedBatch> {
        let mut expired = self.expired(now);
        // keep seal ids stable across runs
        expired.sort();
        expired
            .iter()
            .filter_map(|table| self.seal(table, SealReason::Age))
            .collect()
    }

    /// Tables whose open batch reached its maximum age
    #[must_use]
    pub fn expired(&self, now: Instant) -> Vec<TableId> {
        self.open
            .iter()
            .filter(|(_, batch)| {
                now.saturating_duration_since(batch.created) >= self.limits.max_age
            })
            .map(|(table, _)| table.clone())
            .collect()
    }

    /// Seals the batch of `table` if it reached its maximum age
    pub fn seal_expired(&mut self, table: &TableId, now: Instant) -> Option<SealedBatch> {
        let created = self.open.get(table)?.created;
        if now.saturating_duration_since(created) >= self.limits.max_age {
            self.seal(table, SealReason::Age)
        } else {
            None
        }
    }

    /// Seals the open batch of `table` regardless of thresholds
    pub fn flush(&mut self, table: &TableId) -> Option<SealedBatch> {
        self.seal(table, SealReason::Flush)
    }

    /// Seals all open batches regardless of thresholds
    pub fn flush_all(&mut self) -> Vec<SealedBatch> {
        let mut tables: Vec<TableId> = self.open.keys().cloned().collect();
        tables.sort();
        tables
            .iter()
            .filter_map(|table| self.seal(table, SealReason::Flush))
            .collect()
    }

    /// number of records in the open batch for `table`
    #[must_use]
    pub fn open_records(&self, table: &TableId) -> usize {
        self.open.get(table).map_or(0, |b| b.records.len())
    }

    /// true if no batch is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    // the next record for this table starts a fresh batch
    fn seal(&mut self, table: &TableId, reason: SealReason) -> Option<SealedBatch> {
        let batch = self.open.remove(table)?;
        if batch.records.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(SealedBatch {
            id,
            table: table.clone(),
            records: batch.records,
            bytes: batch.bytes,
            created: batch.created,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Field, FieldValue, SourceOffset};
    use proptest::prelude::*;

    fn record(table: &str, offset: i64) -> Record {
        Record::new(
            TableId::new("p", "d", table),
            vec![Field::new("v", FieldValue::Int64(offset))],
            SourceOffset::new("topic", 0, offset),
            0,
        )
    }

    fn limits(max_records: usize, max_bytes: usize, max_age: Duration) -> BatchLimits {
        BatchLimits {
            max_records,
            max_bytes,
            max_age,
        }
    }

    fn offsets(batch: &SealedBatch) -> Vec<i64> {
        batch.records().iter().map(|r| r.offset().offset).collect()
    }

    #[test]
    fn seals_on_record_count() {
        let now = Instant::now();
        let mut batcher = RecordBatcher::new(limits(100, usize::MAX, Duration::from_secs(60)));
        let mut sealed = Vec::new();
        for i in 0..150 {
            sealed.extend(batcher.append_at(record("t1", i), now));
        }
        assert_eq!(1, sealed.len());
        sealed.extend(batcher.flush_all());

        assert_eq!(2, sealed.len());
        assert_eq!(100, sealed[0].len());
        assert_eq!(SealReason::Records, sealed[0].reason());
        assert_eq!(50, sealed[1].len());
        assert_eq!(SealReason::Flush, sealed[1].reason());
        assert_eq!((0..100).collect::<Vec<_>>(), offsets(&sealed[0]));
        assert_eq!((100..150).collect::<Vec<_>>(), offsets(&sealed[1]));
        assert!(sealed[0].id() < sealed[1].id());
    }

    #[test]
    fn seals_on_bytes() {
        let now = Instant::now();
        // each record is 1 + 8 bytes
        let mut batcher = RecordBatcher::new(limits(1000, 27, Duration::from_secs(60)));
        assert!(batcher.append_at(record("t", 0), now).is_none());
        assert!(batcher.append_at(record("t", 1), now).is_none());
        let sealed = batcher.append_at(record("t", 2), now);
        assert_eq!(Some(SealReason::Bytes), sealed.as_ref().map(SealedBatch::reason));
        assert_eq!(Some(27), sealed.map(|b| b.bytes()));
        assert!(batcher.is_empty());
    }

    #[test]
    fn seals_on_age_during_append_and_tick() {
        let start = Instant::now();
        let max_age = Duration::from_millis(100);
        let mut batcher = RecordBatcher::new(limits(1000, usize::MAX, max_age));
        assert!(batcher.append_at(record("a", 0), start).is_none());
        assert!(batcher.append_at(record("b", 0), start).is_none());

        // not old enough yet
        assert!(batcher.tick(start + Duration::from_millis(50)).is_empty());

        let sealed = batcher.append_at(record("a", 1), start + max_age);
        assert_eq!(Some(SealReason::Age), sealed.as_ref().map(SealedBatch::reason));
        assert_eq!(Some(2), sealed.map(|b| b.len()));

        // no new record for `b` but the tick seals it
        let sealed = batcher.tick(start + max_age);
        assert_eq!(1, sealed.len());
        assert_eq!("b", sealed[0].table().table());
        assert!(batcher.tick(start + max_age * 10).is_empty());
    }

    #[test]
    fn fresh_batch_after_seal_has_its_own_age() {
        let start = Instant::now();
        let max_age = Duration::from_millis(100);
        let mut batcher = RecordBatcher::new(limits(1, usize::MAX, max_age));
        assert!(batcher.append_at(record("a", 0), start).is_some());
        assert_eq!(0, batcher.open_records(&TableId::new("p", "d", "a")));

        let mut batcher = RecordBatcher::new(limits(2, usize::MAX, max_age));
        assert!(batcher.append_at(record("a", 0), start).is_none());
        assert!(batcher.append_at(record("a", 1), start).is_some());
        assert!(batcher
            .append_at(record("a", 2), start + Duration::from_millis(90))
            .is_none());
        // the new batch was created 90ms in, so it is not expired at 100ms
        assert!(batcher
            .seal_expired(&TableId::new("p", "d", "a"), start + max_age)
            .is_none());
        assert!(batcher
            .seal_expired(&TableId::new("p", "d", "a"), start + Duration::from_millis(190))
            .is_some());
    }

    #[test]
    fn seals_exactly_once() {
        let now = Instant::now();
        let mut batcher = RecordBatcher::new(limits(3, usize::MAX, Duration::from_secs(60)));
        let mut seals = 0;
        for i in 0..9 {
            if let Some(batch) = batcher.append_at(record("t", i), now) {
                seals += 1;
                assert_eq!(3, batch.len());
            }
        }
        assert_eq!(3, seals);
        assert!(batcher.flush_all().is_empty());
        assert!(batcher.flush(&TableId::new("p", "d", "t")).is_none());
    }

    #[test]
    fn tables_are_batched_independently() {
        let now = Instant::now();
        let mut batcher = RecordBatcher::new(limits(2, usize::MAX, Duration::from_secs(60)));
        assert!(batcher.append_at(record("a", 0), now).is_none());
        assert!(batcher.append_at(record("b", 0), now).is_none());
        let sealed = batcher.append_at(record("a", 1), now);
        assert_eq!(Some("a"), sealed.as_ref().map(|b| b.table().table()));
        assert_eq!(1, batcher.open_records(&TableId::new("p", "d", "b")));
    }

    proptest! {
        #[test]
        fn sealed_batches_preserve_append_order(
            tables in proptest::collection::vec(0u8..3, 1..300),
            max_records in 1usize..20,
        ) {
            let now = Instant::now();
            let mut batcher = RecordBatcher::new(limits(max_records, usize::MAX, Duration::from_secs(60)));
            let mut sealed = Vec::new();
            let mut expected: HashMap<String, Vec<i64>> = HashMap::new();
            for (offset, table) in (0_i64..).zip(tables.iter()) {
                let name = format!("t{table}");
                expected.entry(name.clone()).or_default().push(offset);
                sealed.extend(batcher.append_at(record(&name, offset), now));
            }
            sealed.extend(batcher.flush_all());

            let mut seen: HashMap<String, Vec<i64>> = HashMap::new();
            for batch in &sealed {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= max_records);
                prop_assert!(batch.records().iter().all(|r| r.table() == batch.table()));
                seen.entry(batch.table().table().to_string()).or_default().extend(offsets(batch));
            }
            prop_assert_eq!(expected, seen);
        }
    }
}
