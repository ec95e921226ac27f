use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::kafka::types::{ConsumerRecord, TopicPartition};
use crate::metrics_const::{PARTITION_OFFSET_GAP_DETECTED, RECORDS_DROPPED_COUNTER};

/// Per-partition queue between the coordinator thread and one partition worker.
///
/// Only the coordinator appends, only the worker drains. The lock is never held
/// across an await or a client call.
#[derive(Debug)]
pub struct DemandBuffer {
    partition: TopicPartition,
    capacity: usize,
    state: Mutex<BufferState>,
    available: Notify,
}

#[derive(Debug)]
struct BufferState {
    records: VecDeque<ConsumerRecord>,
    /// Records asked for and not yet fetched
    demand: usize,
    /// Mirrors the pause state last applied to the client
    paused: bool,
    /// Next offset expected from the client, unknown until the first fetch or seek
    next_offset: Option<i64>,
    closed: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub appended: usize,
    pub duplicates: usize,
    pub gaps: usize,
}

impl DemandBuffer {
    pub fn new(partition: TopicPartition, capacity: usize) -> Self {
        Self {
            partition,
            capacity: capacity.max(1),
            state: Mutex::new(BufferState {
                records: VecDeque::new(),
                demand: 0,
                // new partitions start paused on the client
                paused: true,
                next_offset: None,
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Raise outstanding demand to at least `max_batch`
    pub fn request(&self, max_batch: usize) {
        let mut state = self.state();
        if !state.closed {
            state.demand = state.demand.max(max_batch);
        }
    }

    pub fn demand(&self) -> usize {
        self.state().demand
    }

    /// Whether the next poll should fetch for this partition
    pub fn wants_records(&self) -> bool {
        let state = self.state();
        !state.closed && state.demand > 0 && state.records.len() < self.capacity
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn set_paused(&self, paused: bool) {
        self.state().paused = paused;
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn next_offset(&self) -> Option<i64> {
        self.state().next_offset
    }

    /// Append fetched records in offset order. Records below the expected offset
    /// were already buffered and are dropped; a jump forward is logged and counted.
    pub fn append(&self, records: impl IntoIterator<Item = ConsumerRecord>) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        {
            let mut state = self.state();
            if state.closed {
                return outcome;
            }

            for record in records {
                let offset = record.offset();
                match state.next_offset {
                    Some(expected) if offset < expected => {
                        outcome.duplicates += 1;
                        continue;
                    }
                    Some(expected) if offset > expected => {
                        // compacted topics and transaction markers leave holes too
                        warn!(
                            topic = self.partition.topic(),
                            partition = self.partition.partition(),
                            expected_offset = expected,
                            actual_offset = offset,
                            "Offset gap detected"
                        );
                        outcome.gaps += 1;
                    }
                    _ => {}
                }

                state.next_offset = Some(offset + 1);
                state.demand = state.demand.saturating_sub(1);
                state.records.push_back(record);
                outcome.appended += 1;
            }
        }

        if outcome.duplicates > 0 {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition(),
                duplicates = outcome.duplicates,
                "Dropped already buffered records"
            );
            metrics::counter!(RECORDS_DROPPED_COUNTER, "reason" => "duplicate")
                .increment(outcome.duplicates as u64);
        }
        if outcome.gaps > 0 {
            metrics::counter!(PARTITION_OFFSET_GAP_DETECTED).increment(outcome.gaps as u64);
        }
        if outcome.appended > 0 {
            self.available.notify_one();
        }
        outcome
    }

    /// Remove up to `max` records from the head of the queue
    pub fn drain(&self, max: usize) -> Vec<ConsumerRecord> {
        let mut state = self.state();
        let take = max.min(state.records.len());
        state.records.drain(..take).collect()
    }

    /// Resolves after records were appended or the buffer was closed.
    /// A notification that fired while nobody waited is kept for the next waiter.
    pub async fn records_available(&self) {
        self.available.notified().await
    }

    /// Forget everything buffered and expect `offset` next
    pub fn reset(&self, offset: i64) {
        let mut state = self.state();
        state.records.clear();
        state.next_offset = Some(offset);
    }

    /// Discard buffered records and refuse further appends. Returns the number discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state();
            state.closed = true;
            state.demand = 0;
            let discarded = state.records.len();
            state.records.clear();
            discarded
        };
        self.available.notify_one();
        discarded
    }
}
