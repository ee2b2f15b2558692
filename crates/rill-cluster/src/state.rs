use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::container::{ContainerHandle, ContainerId};
use crate::id::TaskId;
use crate::partition::PartitionRef;

/// The terminal disposition of the job as reported to the cluster.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Undefined,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Undefined => write!(f, "UNDEFINED"),
            JobStatus::Succeeded => write!(f, "SUCCEEDED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// The in-memory source of truth for the job.
///
/// All mutation happens on the coordinator's dispatcher; other threads only
/// ever see immutable [JobStateSnapshot] values published after each event.
pub struct JobState {
    task_count: u32,
    /// Tasks awaiting a container. Disjoint from `running_tasks` and
    /// `finished_tasks`.
    pub unclaimed_tasks: BTreeSet<TaskId>,
    pub running_tasks: HashMap<TaskId, ContainerHandle>,
    /// Tasks that completed with exit status zero.
    pub finished_tasks: BTreeSet<TaskId>,
    /// Present exactly for the tasks in `running_tasks`.
    pub task_partitions: HashMap<TaskId, BTreeSet<PartitionRef>>,
    /// Outstanding container requests not yet satisfied.
    pub needed_containers: u32,
    pub completed_tasks: u32,
    pub failed_containers: u64,
    pub released_containers: u64,
    pub status: JobStatus,
    pub too_many_failed_containers: bool,
}

impl JobState {
    pub fn new(task_count: u32) -> Self {
        Self {
            task_count,
            unclaimed_tasks: BTreeSet::new(),
            running_tasks: HashMap::new(),
            finished_tasks: BTreeSet::new(),
            task_partitions: HashMap::new(),
            needed_containers: 0,
            completed_tasks: 0,
            failed_containers: 0,
            released_containers: 0,
            status: JobStatus::Undefined,
            too_many_failed_containers: false,
        }
    }

    pub fn task_count(&self) -> u32 {
        self.task_count
    }

    /// Mark every task as awaiting a container.
    pub fn reset_unclaimed(&mut self) {
        self.unclaimed_tasks = TaskId::all(self.task_count).collect();
        self.needed_containers = self.task_count;
    }

    /// The smallest unclaimed task, if any. Picking the smallest keeps
    /// container assignment deterministic.
    pub fn next_unclaimed_task(&self) -> Option<TaskId> {
        self.unclaimed_tasks.iter().next().copied()
    }

    /// Bind an unclaimed task to an allocated container.
    pub fn bind_task(
        &mut self,
        task_id: TaskId,
        container: ContainerHandle,
        partitions: BTreeSet<PartitionRef>,
    ) {
        self.unclaimed_tasks.remove(&task_id);
        self.running_tasks.insert(task_id, container);
        self.task_partitions.insert(task_id, partitions);
        self.needed_containers = self.needed_containers.saturating_sub(1);
    }

    /// Remove the binding for the task running in the given container, if
    /// one exists. Completions for containers released without a binding
    /// legitimately find nothing here.
    pub fn unbind_container(&mut self, container_id: &ContainerId) -> Option<TaskId> {
        let task_id = self
            .running_tasks
            .iter()
            .find(|(_, container)| &container.id == container_id)
            .map(|(task_id, _)| *task_id)?;
        self.running_tasks.remove(&task_id);
        self.task_partitions.remove(&task_id);
        Some(task_id)
    }

    /// Return a task to the unclaimed set so that a replacement container
    /// can pick it up.
    pub fn requeue_task(&mut self, task_id: TaskId) {
        self.unclaimed_tasks.insert(task_id);
    }

    pub fn mark_finished(&mut self, task_id: TaskId) {
        self.finished_tasks.insert(task_id);
        if self.finished_tasks.len() as u32 == self.task_count {
            self.status = JobStatus::Succeeded;
        }
    }

    pub fn mark_failed(&mut self) {
        self.too_many_failed_containers = true;
        self.status = JobStatus::Failed;
    }

    pub fn snapshot(&self) -> JobStateSnapshot {
        let mut running: Vec<RunningTaskSnapshot> = self
            .running_tasks
            .iter()
            .map(|(task_id, container)| RunningTaskSnapshot {
                task_id: *task_id,
                container_id: container.id.clone(),
                node: container.node(),
                partitions: self
                    .task_partitions
                    .get(task_id)
                    .map(|partitions| partitions.iter().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect();
        running.sort_by_key(|task| task.task_id);
        JobStateSnapshot {
            task_count: self.task_count,
            unclaimed_tasks: self.unclaimed_tasks.iter().copied().collect(),
            running_tasks: running,
            finished_tasks: self.finished_tasks.iter().copied().collect(),
            needed_containers: self.needed_containers,
            completed_tasks: self.completed_tasks,
            failed_containers: self.failed_containers,
            released_containers: self.released_containers,
            status: self.status,
        }
    }
}

/// An immutable copy of the job state for the status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStateSnapshot {
    pub task_count: u32,
    pub unclaimed_tasks: Vec<TaskId>,
    pub running_tasks: Vec<RunningTaskSnapshot>,
    pub finished_tasks: Vec<TaskId>,
    pub needed_containers: u32,
    pub completed_tasks: u32,
    pub failed_containers: u64,
    pub released_containers: u64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningTaskSnapshot {
    pub task_id: TaskId,
    pub container_id: ContainerId,
    pub node: String,
    pub partitions: Vec<PartitionRef>,
}
