use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::clock::Clock;
use crate::command::create_command_builder;
use crate::container::{ContainerHandle, ContainerId, ContainerStatus, Credentials, Resource};
use crate::coordinator::{ClusterListener, CoordinatorOptions};
use crate::failure::{FailureController, FailureVerdict};
use crate::id::TaskId;
use crate::launch::{build_launch_context, PackageResource};
use crate::partition::{assign_partitions, PartitionRef};
use crate::resource_manager::{NodeManagerClient, ResourceManagerClient};
use crate::state::{JobState, JobStatus};

/// All container requests carry the same priority; the job has no reason
/// to rank its own tasks against each other.
pub const CONTAINER_REQUEST_PRIORITY: i32 = 0;

#[derive(Clone)]
pub struct TaskManagerOptions {
    pub task_count: u32,
    pub container_resource: Resource,
    pub retry_count: i32,
    pub retry_window_ms: u64,
    pub package: PackageResource,
    pub command_class: String,
    pub all_partitions: Vec<PartitionRef>,
    pub credentials: Credentials,
}

impl TaskManagerOptions {
    pub fn new(options: &CoordinatorOptions) -> Self {
        Self {
            task_count: options.task_count,
            container_resource: options.container_resource,
            retry_count: options.retry_count,
            retry_window_ms: options.retry_window_ms,
            package: options.package.clone(),
            command_class: options.command_class.clone(),
            all_partitions: options.all_partitions.clone(),
            credentials: options.credentials.clone(),
        }
    }
}

/// Binds task groups to allocated containers and keeps the job supplied
/// with exactly as many outstanding container requests as there are
/// unclaimed tasks.
pub struct TaskManager {
    options: TaskManagerOptions,
    resource_manager: Arc<dyn ResourceManagerClient>,
    node_manager: Arc<dyn NodeManagerClient>,
    failure_policy: FailureController,
    clock: Arc<dyn Clock>,
}

impl TaskManager {
    pub fn new(
        options: TaskManagerOptions,
        resource_manager: Arc<dyn ResourceManagerClient>,
        node_manager: Arc<dyn NodeManagerClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let failure_policy = FailureController::new(options.retry_count, options.retry_window_ms);
        Self {
            options,
            resource_manager,
            node_manager,
            failure_policy,
            clock,
        }
    }

    fn request_containers(&self, count: u32) {
        for _ in 0..count {
            if let Err(e) = self
                .resource_manager
                .request_container(self.options.container_resource, CONTAINER_REQUEST_PRIORITY)
            {
                error!("failed to request a container: {e}");
            }
        }
    }

    fn release_container(&self, container: &ContainerHandle, reason: &str) {
        info!("releasing container {}: {reason}", container.id);
        if let Err(e) = self.resource_manager.release_container(&container.id) {
            error!("failed to release container {}: {e}", container.id);
        }
    }

    fn launch_container(&mut self, state: &mut JobState, task_id: TaskId, container: &ContainerHandle) {
        let partitions = assign_partitions(
            task_id,
            self.options.task_count,
            &self.options.all_partitions,
        );
        let mut builder = match create_command_builder(&self.options.command_class) {
            Ok(builder) => builder,
            Err(e) => {
                error!("cannot build the worker command: {e}");
                self.release_container(container, "cannot construct a worker command");
                return;
            }
        };
        builder.set_name(format!("task-{task_id}"));
        builder.set_task(task_id);
        builder.set_partitions(partitions.clone());
        let context =
            match build_launch_context(&self.options.package, builder.as_ref(), &self.options.credentials) {
                Ok(context) => context,
                Err(e) => {
                    error!("cannot build the launch context for task {task_id}: {e}");
                    self.release_container(container, "cannot construct a launch context");
                    return;
                }
            };
        if let Err(e) = self.node_manager.start_container(container, context) {
            // The cluster reports the container's fate either way; the
            // completion event repairs the state.
            error!(
                "failed to start container {} for task {task_id}: {e}",
                container.id
            );
        }
        state.bind_task(task_id, container.clone(), partitions);
        info!(
            "task {task_id} is running in container {} on {}",
            container.id,
            container.node()
        );
    }
}

impl ClusterListener for TaskManager {
    fn on_init(&mut self, state: &mut JobState) {
        state.reset_unclaimed();
        if let Err(e) = self.node_manager.start() {
            error!("failed to start the node manager client: {e}");
        }
        info!(
            "requesting {} containers of {}",
            self.options.task_count, self.options.container_resource
        );
        self.request_containers(self.options.task_count);
    }

    fn on_container_allocated(&mut self, state: &mut JobState, container: &ContainerHandle) {
        match state.next_unclaimed_task() {
            Some(task_id) => self.launch_container(state, task_id, container),
            // Nothing left to place; the allocation is surplus.
            None => self.release_container(container, "no unclaimed tasks remain"),
        }
    }

    fn on_container_completed(&mut self, state: &mut JobState, status: &ContainerStatus) {
        let task_id = state.unbind_container(&status.container_id);
        match status.exit_status {
            0 => {
                state.completed_tasks += 1;
                if let Some(task_id) = task_id {
                    info!(
                        "task {task_id} completed in container {}",
                        status.container_id
                    );
                    self.failure_policy.record_success(task_id);
                    state.mark_finished(task_id);
                    if state.status == JobStatus::Succeeded {
                        info!("all {} tasks have completed", state.task_count());
                    }
                }
            }
            exit if status.was_released() => {
                state.released_containers += 1;
                if let Some(task_id) = task_id {
                    // The cluster took the container back; this is not the
                    // worker's fault, so the retry budget is untouched.
                    warn!(
                        "container {} for task {task_id} was released by the cluster \
                         (exit status {exit}); requesting a replacement",
                        status.container_id
                    );
                    state.requeue_task(task_id);
                    state.needed_containers += 1;
                    self.request_containers(1);
                }
            }
            exit => {
                state.failed_containers += 1;
                if let Some(task_id) = task_id {
                    error!(
                        "container {} for task {task_id} failed with exit status {exit}{}",
                        status.container_id,
                        status
                            .diagnostics
                            .as_deref()
                            .map(|d| format!(": {d}"))
                            .unwrap_or_default()
                    );
                    state.requeue_task(task_id);
                    let now = self.clock.now_millis();
                    match self.failure_policy.record_failure(task_id, now) {
                        FailureVerdict::Retry => {
                            state.needed_containers += 1;
                            self.request_containers(1);
                        }
                        FailureVerdict::Fatal => {
                            error!("task {task_id} has exhausted its retry budget; failing the job");
                            state.mark_failed();
                        }
                    }
                }
            }
        }
    }

    fn on_container_released(&mut self, _state: &mut JobState, container_id: &ContainerId) {
        debug!("cluster acknowledged the release of container {container_id}");
    }

    fn on_heartbeat(&mut self, state: &mut JobState) {
        debug!(
            "job progress: {} finished, {} running, {} unclaimed, {} containers needed",
            state.finished_tasks.len(),
            state.running_tasks.len(),
            state.unclaimed_tasks.len(),
            state.needed_containers
        );
    }

    fn should_shutdown(&self, state: &JobState) -> bool {
        state.status == JobStatus::Succeeded || state.too_many_failed_containers
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::container::{ContainerStatus, RELEASED_EXIT_STATUS};
    use crate::coordinator::ClusterEventSender;
    use crate::error::ClusterError;
    use crate::launch::ContainerLaunchContext;

    #[derive(Default)]
    struct MockResourceManager {
        requests: Mutex<Vec<Resource>>,
        releases: Mutex<Vec<ContainerId>>,
    }

    impl MockResourceManager {
        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn released(&self) -> Vec<ContainerId> {
            self.releases.lock().unwrap().clone()
        }
    }

    impl ResourceManagerClient for MockResourceManager {
        fn start(&self, _events: ClusterEventSender) -> Result<(), ClusterError> {
            Ok(())
        }

        fn register(
            &self,
            _host: &str,
            _port: u16,
            _tracking_url: &str,
        ) -> Result<Resource, ClusterError> {
            Ok(Resource {
                memory_mb: 8192,
                cpu_cores: 8,
            })
        }

        fn request_container(
            &self,
            resource: Resource,
            _priority: i32,
        ) -> Result<(), ClusterError> {
            self.requests.lock().unwrap().push(resource);
            Ok(())
        }

        fn release_container(&self, container_id: &ContainerId) -> Result<(), ClusterError> {
            self.releases.lock().unwrap().push(container_id.clone());
            Ok(())
        }

        fn unregister(&self, _status: JobStatus, _message: &str) -> Result<(), ClusterError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockNodeManager {
        started: Mutex<Vec<(ContainerId, ContainerLaunchContext)>>,
    }

    impl MockNodeManager {
        fn started_count(&self) -> usize {
            self.started.lock().unwrap().len()
        }
    }

    impl NodeManagerClient for MockNodeManager {
        fn start(&self) -> Result<(), ClusterError> {
            Ok(())
        }

        fn start_container(
            &self,
            container: &ContainerHandle,
            context: ContainerLaunchContext,
        ) -> Result<(), ClusterError> {
            self.started
                .lock()
                .unwrap()
                .push((container.id.clone(), context));
            Ok(())
        }
    }

    struct Fixture {
        resource_manager: Arc<MockResourceManager>,
        node_manager: Arc<MockNodeManager>,
        clock: Arc<ManualClock>,
        task_manager: TaskManager,
        state: JobState,
    }

    fn fixture(task_count: u32, retry_count: i32, retry_window_ms: u64) -> Fixture {
        let resource_manager = Arc::new(MockResourceManager::default());
        let node_manager = Arc::new(MockNodeManager::default());
        let clock = Arc::new(ManualClock::new(0));
        let options = TaskManagerOptions {
            task_count,
            container_resource: Resource {
                memory_mb: 1024,
                cpu_cores: 1,
            },
            retry_count,
            retry_window_ms,
            package: PackageResource::from_path("/opt/job/package.tgz"),
            command_class: "shell".to_string(),
            all_partitions: (0..task_count * 2)
                .map(|p| PartitionRef::new("kafka", "events", p))
                .collect(),
            credentials: Credentials::default(),
        };
        let task_manager = TaskManager::new(
            options,
            resource_manager.clone(),
            node_manager.clone(),
            clock.clone(),
        );
        Fixture {
            resource_manager,
            node_manager,
            clock,
            task_manager,
            state: JobState::new(task_count),
        }
    }

    fn container(id: &str) -> ContainerHandle {
        ContainerHandle {
            id: ContainerId::new(id),
            node_host: "node-1".to_string(),
            node_port: 8041,
            resource: Resource {
                memory_mb: 1024,
                cpu_cores: 1,
            },
        }
    }

    fn completed(id: &str, exit_status: i32) -> ContainerStatus {
        ContainerStatus {
            container_id: ContainerId::new(id),
            exit_status,
            diagnostics: None,
        }
    }

    /// The task sets partition the job and the request ledger matches the
    /// unclaimed set.
    fn assert_invariants(state: &JobState) {
        let total = state.unclaimed_tasks.len()
            + state.running_tasks.len()
            + state.finished_tasks.len();
        assert_eq!(total as u32, state.task_count());
        for task_id in &state.unclaimed_tasks {
            assert!(!state.running_tasks.contains_key(task_id));
            assert!(!state.finished_tasks.contains(task_id));
        }
        assert_eq!(state.needed_containers as usize, state.unclaimed_tasks.len());
        assert_eq!(state.task_partitions.len(), state.running_tasks.len());
    }

    #[test]
    fn test_happy_path_with_two_tasks() {
        let mut f = fixture(2, 8, 300000);
        f.task_manager.on_init(&mut f.state);
        assert_eq!(f.resource_manager.request_count(), 2);
        assert_eq!(f.state.needed_containers, 2);
        assert_invariants(&f.state);

        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-a"));
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-b"));
        assert_eq!(f.state.running_tasks.len(), 2);
        assert_eq!(f.state.needed_containers, 0);
        assert_eq!(
            f.state.running_tasks[&TaskId::new(0)].id,
            ContainerId::new("c-a")
        );
        assert_eq!(
            f.state.running_tasks[&TaskId::new(1)].id,
            ContainerId::new("c-b")
        );
        assert_eq!(f.node_manager.started_count(), 2);
        assert_invariants(&f.state);

        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-a", 0));
        assert_eq!(f.state.status, JobStatus::Undefined);
        assert!(!f.task_manager.should_shutdown(&f.state));
        assert_invariants(&f.state);

        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-b", 0));
        assert_eq!(f.state.status, JobStatus::Succeeded);
        assert_eq!(f.state.finished_tasks.len(), 2);
        assert_eq!(f.state.completed_tasks, 2);
        assert!(f.task_manager.should_shutdown(&f.state));
        assert_invariants(&f.state);
    }

    #[test]
    fn test_crash_loop_exhausts_the_retry_budget() {
        let mut f = fixture(1, 2, 60000);
        f.task_manager.on_init(&mut f.state);
        assert_eq!(f.resource_manager.request_count(), 1);

        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-1"));
        f.clock.set(1000);
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-1", 1));
        assert_eq!(f.resource_manager.request_count(), 2);
        assert_eq!(f.state.unclaimed_tasks.len(), 1);
        assert_eq!(f.state.status, JobStatus::Undefined);
        assert_invariants(&f.state);

        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-2"));
        f.clock.set(2000);
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-2", 1));
        assert_eq!(f.resource_manager.request_count(), 3);
        assert_eq!(f.state.status, JobStatus::Undefined);

        // The third crash lands 1000 ms after the second, well inside the
        // window, with the budget already exhausted.
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-3"));
        f.clock.set(3000);
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-3", 1));
        assert_eq!(f.state.status, JobStatus::Failed);
        assert!(f.state.too_many_failed_containers);
        assert!(f.task_manager.should_shutdown(&f.state));
        // No replacement is requested for a failing job.
        assert_eq!(f.resource_manager.request_count(), 3);
        assert_eq!(f.state.failed_containers, 3);
    }

    #[test]
    fn test_slow_crashes_keep_retrying() {
        let mut f = fixture(1, 2, 60000);
        f.task_manager.on_init(&mut f.state);
        for (index, at) in [1000i64, 62000, 123000, 184000].into_iter().enumerate() {
            let id = format!("c-{index}");
            f.task_manager
                .on_container_allocated(&mut f.state, &container(&id));
            f.clock.set(at);
            f.task_manager
                .on_container_completed(&mut f.state, &completed(&id, 1));
            // Each crash is a full window after the previous one, so the
            // counter keeps resetting.
            assert_eq!(f.state.status, JobStatus::Undefined);
            assert!(!f.task_manager.should_shutdown(&f.state));
            assert_invariants(&f.state);
        }
        assert_eq!(f.resource_manager.request_count(), 5);
    }

    #[test]
    fn test_preemption_is_not_a_crash() {
        let mut f = fixture(1, 0, 60000);
        f.task_manager.on_init(&mut f.state);
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-1"));
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-1", RELEASED_EXIT_STATUS));
        // A zero retry budget applies to true crashes only.
        assert_eq!(f.state.released_containers, 1);
        assert_eq!(f.state.failed_containers, 0);
        assert_eq!(f.resource_manager.request_count(), 2);
        assert_eq!(f.state.status, JobStatus::Undefined);
        assert!(!f.task_manager.should_shutdown(&f.state));
        assert_invariants(&f.state);
    }

    #[test]
    fn test_surplus_allocation_is_released_untouched() {
        let mut f = fixture(1, 8, 300000);
        f.task_manager.on_init(&mut f.state);
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-1"));
        let before_running = f.state.running_tasks.clone();

        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-2"));
        assert_eq!(f.resource_manager.released(), vec![ContainerId::new("c-2")]);
        assert_eq!(f.state.running_tasks, before_running);
        assert_eq!(f.state.needed_containers, 0);
        assert_eq!(f.node_manager.started_count(), 1);
        assert_invariants(&f.state);
    }

    #[test]
    fn test_replacements_match_bound_releases() {
        let mut f = fixture(1, 8, 300000);
        f.task_manager.on_init(&mut f.state);
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-1"));
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-1", RELEASED_EXIT_STATUS));
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-2"));
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-2", RELEASED_EXIT_STATUS));
        // One initial request plus one replacement per bound release.
        assert_eq!(f.resource_manager.request_count(), 3);
        assert_eq!(f.state.released_containers, 2);

        // The task is back in a running state after the next allocation.
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-3"));
        assert!(f.state.running_tasks.contains_key(&TaskId::new(0)));
        assert_invariants(&f.state);
    }

    #[test]
    fn test_unbound_release_requests_no_replacement() {
        let mut f = fixture(1, 8, 300000);
        f.task_manager.on_init(&mut f.state);
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-1"));
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-2"));
        // The surplus container completes after its release.
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-2", RELEASED_EXIT_STATUS));
        assert_eq!(f.state.released_containers, 1);
        assert_eq!(f.resource_manager.request_count(), 1);
        assert_invariants(&f.state);
    }

    #[test]
    fn test_unbound_clean_completion_only_bumps_the_counter() {
        let mut f = fixture(1, 8, 300000);
        f.task_manager.on_init(&mut f.state);
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-unknown", 0));
        assert_eq!(f.state.completed_tasks, 1);
        assert!(f.state.finished_tasks.is_empty());
        // The counter alone never declares success.
        assert_eq!(f.state.status, JobStatus::Undefined);
        assert!(!f.task_manager.should_shutdown(&f.state));
    }

    #[test]
    fn test_success_clears_the_failure_record() {
        let mut f = fixture(1, 1, 60000);
        f.task_manager.on_init(&mut f.state);
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-1"));
        f.clock.set(1000);
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-1", 1));
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-2"));
        f.clock.set(1500);
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-2", 0));
        assert_eq!(f.state.status, JobStatus::Succeeded);
        assert_eq!(f.task_manager.failure_policy.failure_count(TaskId::new(0)), 0);
    }

    #[test]
    fn test_partitions_follow_the_task_binding() {
        let mut f = fixture(2, 8, 300000);
        f.task_manager.on_init(&mut f.state);
        f.task_manager
            .on_container_allocated(&mut f.state, &container("c-a"));
        let partitions = &f.state.task_partitions[&TaskId::new(0)];
        // Four partitions dealt over two tasks.
        assert_eq!(partitions.len(), 2);
        f.task_manager
            .on_container_completed(&mut f.state, &completed("c-a", 1));
        assert!(!f.state.task_partitions.contains_key(&TaskId::new(0)));
    }
}
