use serde::Serialize;

/// The identifier of a task group.
/// Task identifiers are dense integers in `[0, task_count)` and are stable
/// for the lifetime of the job.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(u32);

impl TaskId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// All task identifiers of a job with the given task count, in order.
    pub fn all(task_count: u32) -> impl Iterator<Item = TaskId> {
        (0..task_count).map(TaskId)
    }
}

impl From<u32> for TaskId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
