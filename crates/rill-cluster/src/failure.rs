use std::collections::HashMap;

use log::warn;

use crate::id::TaskId;

/// The decision for one recorded crash.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailureVerdict {
    Retry,
    Fatal,
}

#[derive(Debug, Copy, Clone)]
struct TaskFailure {
    count: u32,
    last_failure_ms: i64,
}

/// Per-task crash bookkeeping with a sliding count-and-time window.
///
/// A task becomes fatal only when it has exhausted its retry budget and the
/// most recent two crashes landed within one window: occasional flaps keep
/// retrying forever, tight crash loops stop the job.
pub struct FailureController {
    retry_count: i32,
    retry_window_ms: i64,
    failures: HashMap<TaskId, TaskFailure>,
}

impl FailureController {
    pub fn new(retry_count: i32, retry_window_ms: u64) -> Self {
        Self {
            retry_count,
            retry_window_ms: retry_window_ms as i64,
            failures: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, task_id: TaskId, now_ms: i64) -> FailureVerdict {
        if self.retry_count == 0 {
            return FailureVerdict::Fatal;
        }
        if self.retry_count < 0 {
            return FailureVerdict::Retry;
        }
        let previous = self
            .failures
            .get(&task_id)
            .copied()
            .unwrap_or(TaskFailure {
                count: 0,
                last_failure_ms: 0,
            });
        let new_count = previous.count + 1;
        if new_count > self.retry_count as u32 {
            if now_ms - previous.last_failure_ms < self.retry_window_ms {
                warn!(
                    "task {task_id} crashed {new_count} times within {} ms",
                    self.retry_window_ms
                );
                return FailureVerdict::Fatal;
            }
            // The last crash was long enough ago; start a fresh window.
            self.failures.insert(
                task_id,
                TaskFailure {
                    count: 1,
                    last_failure_ms: now_ms,
                },
            );
            return FailureVerdict::Retry;
        }
        self.failures.insert(
            task_id,
            TaskFailure {
                count: new_count,
                last_failure_ms: now_ms,
            },
        );
        FailureVerdict::Retry
    }

    pub fn record_success(&mut self, task_id: TaskId) {
        self.failures.remove(&task_id);
    }

    pub fn failure_count(&self, task_id: TaskId) -> u32 {
        self.failures.get(&task_id).map(|f| f.count).unwrap_or(0)
    }
}
