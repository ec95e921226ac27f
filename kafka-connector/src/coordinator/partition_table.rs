use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::coordinator::demand_buffer::DemandBuffer;
use crate::kafka::types::{PartitionState, TopicPartition};

#[derive(Debug, Clone)]
pub struct PartitionSlot {
    pub state: PartitionState,
    pub buffer: Arc<DemandBuffer>,
}

/// Partitions owned by this member. Absent means Unassigned.
///
/// Shared between the coordinator loop and the rebalance bridge, both on the
/// coordinator thread. Guards are never held across client calls.
#[derive(Debug, Default)]
pub struct PartitionTable {
    slots: DashMap<TopicPartition, PartitionSlot>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, partition: &TopicPartition) -> PartitionState {
        self.slots
            .get(partition)
            .map(|slot| slot.state)
            .unwrap_or(PartitionState::Unassigned)
    }

    pub fn contains(&self, partition: &TopicPartition) -> bool {
        self.slots.contains_key(partition)
    }

    pub fn buffer(&self, partition: &TopicPartition) -> Option<Arc<DemandBuffer>> {
        self.slots.get(partition).map(|slot| slot.buffer.clone())
    }

    /// Buffer of a partition that may receive records
    pub fn active_buffer(&self, partition: &TopicPartition) -> Option<Arc<DemandBuffer>> {
        self.slots
            .get(partition)
            .filter(|slot| slot.state == PartitionState::Active)
            .map(|slot| slot.buffer.clone())
    }

    pub fn insert(&self, partition: TopicPartition, slot: PartitionSlot) {
        self.slots.insert(partition, slot);
    }

    pub fn remove(&self, partition: &TopicPartition) -> Option<PartitionSlot> {
        self.slots.remove(partition).map(|(_, slot)| slot)
    }

    pub fn set_state(&self, partitions: &BTreeSet<TopicPartition>, state: PartitionState) {
        for partition in partitions {
            if let Some(mut slot) = self.slots.get_mut(partition) {
                slot.state = state;
            }
        }
    }

    pub fn owned(&self) -> BTreeSet<TopicPartition> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Copy of every slot so callers can work without holding map guards
    pub fn snapshot(&self) -> Vec<(TopicPartition, PartitionSlot)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(partition: &TopicPartition, state: PartitionState) -> PartitionSlot {
        PartitionSlot {
            state,
            buffer: Arc::new(DemandBuffer::new(partition.clone(), 10)),
        }
    }

    #[test]
    fn test_absent_partition_is_unassigned() {
        let table = PartitionTable::new();
        let tp = TopicPartition::new("events", 0);
        assert_eq!(table.state(&tp), PartitionState::Unassigned);
        assert!(table.buffer(&tp).is_none());
    }

    #[test]
    fn test_only_active_partitions_expose_active_buffer() {
        let table = PartitionTable::new();
        let tp = TopicPartition::new("events", 0);
        table.insert(tp.clone(), slot(&tp, PartitionState::Assigning));
        assert!(table.active_buffer(&tp).is_none());

        table.set_state(&BTreeSet::from([tp.clone()]), PartitionState::Active);
        assert!(table.active_buffer(&tp).is_some());

        table.set_state(&BTreeSet::from([tp.clone()]), PartitionState::Revoking);
        assert!(table.active_buffer(&tp).is_none());
        assert_eq!(table.owned(), BTreeSet::from([tp]));
    }
}
