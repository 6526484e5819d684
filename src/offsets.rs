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

use crate::record::{SourceOffset, TopicPartition};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug)]
struct PartitionOffsets {
    /// lowest offset tracked since the task started
    first: i64,
    /// tracked but not yet delivered
    pending: BTreeSet<i64>,
    highest_done: Option<i64>,
}

impl PartitionOffsets {
    fn new(first: i64) -> Self {
        Self {
            first,
            pending: BTreeSet::new(),
            highest_done: None,
        }
    }

    /// next offset to consume, everything below it was delivered
    fn committable(&self) -> Option<i64> {
        match self.pending.iter().next() {
            Some(lowest) if *lowest > self.first => Some(*lowest),
            Some(_) => None,
            None => self.highest_done.map(|done| done + 1),
        }
    }
}

/// Tracks which offsets per topic-partition are safe to commit
///
/// An offset is tracked when its record is accepted by `put` and completed once the record
/// was delivered (or routed to the dead-letter sink). Offsets of records that failed under
/// the `halt` policy are never completed, so the committable offset never moves past them.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<TopicPartition, PartitionOffsets>,
}

impl OffsetTracker {
    /// creates an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// marks an offset as in flight
    pub fn track(&mut self, offset: &SourceOffset) {
        self.partitions
            .entry(offset.partition.clone())
            .or_insert_with(|| PartitionOffsets::new(offset.offset))
            .pending
            .insert(offset.offset);
    }

    /// marks offsets as delivered
    pub fn complete<'offset>(&mut self, offsets: impl IntoIterator<Item = &'offset SourceOffset>) {
        for offset in offsets {
            if let Some(partition) = self.partitions.get_mut(&offset.partition) {
                if partition.pending.remove(&offset.offset) {
                    partition.highest_done = partition.highest_done.max(Some(offset.offset));
                }
            }
        }
    }

    /// The next offset to consume for every partition that made progress
    #[must_use]
    pub fn committable(&self) -> HashMap<TopicPartition, i64> {
        self.partitions
            .iter()
            .filter_map(|(tp, offsets)| offsets.committable().map(|o| (tp.clone(), o)))
            .collect()
    }

    /// number of offsets in flight
    #[must_use]
    pub fn pending(&self) -> usize {
        self.partitions.values().map(|p| p.pending.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(topic: &str, partition: i32, range: std::ops::Range<i64>) -> Vec<SourceOffset> {
        range
            .map(|o| SourceOffset::new(topic, partition, o))
            .collect()
    }

    #[test]
    fn nothing_is_committable_before_progress() {
        let mut tracker = OffsetTracker::new();
        for o in &offsets("snot", 0, 10..20) {
            tracker.track(o);
        }
        assert!(tracker.committable().is_empty());
        assert_eq!(10, tracker.pending());
    }

    #[test]
    fn commits_stop_at_the_first_undelivered_offset() {
        let mut tracker = OffsetTracker::new();
        let all = offsets("snot", 0, 10..20);
        for o in &all {
            tracker.track(o);
        }
        // 10..13 and 15..20 delivered, 13 and 14 still in flight
        tracker.complete(all[..3].iter().chain(&all[5..]));
        assert_eq!(
            Some(&13),
            tracker.committable().get(&TopicPartition::new("snot", 0))
        );

        tracker.complete(&all[3..5]);
        assert_eq!(
            Some(&20),
            tracker.committable().get(&TopicPartition::new("snot", 0))
        );
        assert_eq!(0, tracker.pending());
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        let zero = offsets("snot", 0, 0..5);
        let one = offsets("snot", 1, 100..105);
        let other = offsets("badger", 0, 0..5);
        for o in zero.iter().chain(&one).chain(&other) {
            tracker.track(o);
        }
        tracker.complete(&zero);
        tracker.complete(&one[..2]);

        let committable = tracker.committable();
        assert_eq!(2, committable.len());
        assert_eq!(Some(&5), committable.get(&TopicPartition::new("snot", 0)));
        assert_eq!(Some(&102), committable.get(&TopicPartition::new("snot", 1)));
        assert_eq!(None, committable.get(&TopicPartition::new("badger", 0)));
    }

    #[test]
    fn unknown_offsets_are_ignored() {
        let mut tracker = OffsetTracker::new();
        tracker.complete(&offsets("snot", 0, 0..3));
        assert!(tracker.committable().is_empty());
    }
}
