use std::collections::BTreeSet;

use serde::Serialize;

use crate::id::TaskId;

/// A partition of a named input stream.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct PartitionRef {
    pub system: String,
    pub stream: String,
    pub partition: u32,
}

impl PartitionRef {
    pub fn new(system: impl Into<String>, stream: impl Into<String>, partition: u32) -> Self {
        Self {
            system: system.into(),
            stream: stream.into(),
            partition,
        }
    }
}

impl std::fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.system, self.stream, self.partition)
    }
}

/// The partition subset owned by one task group.
///
/// Partitions are sorted by `(system, stream, partition)` and then dealt
/// round-robin, so task `k` owns every partition whose sorted index is
/// congruent to `k` modulo the task count. The result is deterministic and
/// stable under reordering of the input.
pub fn assign_partitions(
    task_id: TaskId,
    task_count: u32,
    all_partitions: &[PartitionRef],
) -> BTreeSet<PartitionRef> {
    let mut sorted: Vec<&PartitionRef> = all_partitions.iter().collect();
    sorted.sort();
    sorted.dedup();
    sorted
        .into_iter()
        .enumerate()
        .filter(|(index, _)| (*index as u32) % task_count == task_id.value())
        .map(|(_, partition)| partition.clone())
        .collect()
}
