use std::sync::Arc;

use log::{error, info};

use crate::container::Resource;
use crate::coordinator::{ClusterListener, CoordinatorOptions};
use crate::resource_manager::ResourceManagerClient;
use crate::state::{JobState, JobStatus};

#[derive(Clone)]
pub struct LifecycleOptions {
    pub listen_host: String,
    pub listen_port: u16,
    pub tracking_url: String,
    pub required_resource: Resource,
}

impl LifecycleOptions {
    pub fn new(options: &CoordinatorOptions) -> Self {
        Self {
            listen_host: options.listen_host.clone(),
            listen_port: options.listen_port,
            tracking_url: options.tracking_url.clone(),
            required_resource: options.container_resource,
        }
    }
}

/// Registers the application master with the cluster, validates that the
/// granted capability can satisfy the job, and deregisters with the final
/// status when the event loop winds down.
pub struct LifecycleCoordinator {
    options: LifecycleOptions,
    resource_manager: Arc<dyn ResourceManagerClient>,
    registered: bool,
    shutdown: bool,
}

impl LifecycleCoordinator {
    pub fn new(options: LifecycleOptions, resource_manager: Arc<dyn ResourceManagerClient>) -> Self {
        Self {
            options,
            resource_manager,
            registered: false,
            shutdown: false,
        }
    }

    fn final_message(state: &JobState) -> String {
        match state.status {
            JobStatus::Succeeded => format!("all {} tasks completed", state.task_count()),
            JobStatus::Failed if state.too_many_failed_containers => {
                "a task exhausted its container retry budget".to_string()
            }
            JobStatus::Failed => "the job could not be run on this cluster".to_string(),
            JobStatus::Undefined => "the application master was asked to stop".to_string(),
        }
    }
}

impl ClusterListener for LifecycleCoordinator {
    fn on_init(&mut self, state: &mut JobState) {
        let granted = match self.resource_manager.register(
            &self.options.listen_host,
            self.options.listen_port,
            &self.options.tracking_url,
        ) {
            Ok(granted) => granted,
            Err(e) => {
                error!("failed to register the application master: {e}");
                state.status = JobStatus::Failed;
                self.shutdown = true;
                return;
            }
        };
        self.registered = true;
        info!("registered application master; largest grantable container: {granted}");
        if !granted.satisfies(&self.options.required_resource) {
            error!(
                "the cluster cannot grant the required container capability \
                 (required {}, granted at most {granted})",
                self.options.required_resource
            );
            state.status = JobStatus::Failed;
            self.shutdown = true;
        }
    }

    fn on_reboot(&mut self, state: &mut JobState) {
        // The cluster's reboot signal would require renegotiating every
        // container binding; the supported recovery path is a fresh
        // application master process started by the cluster's retry policy.
        error!("the resource manager requested a reboot, which is not supported");
        state.status = JobStatus::Failed;
        self.shutdown = true;
    }

    fn should_shutdown(&self, _state: &JobState) -> bool {
        self.shutdown
    }

    fn on_shutdown(&mut self, state: &mut JobState) {
        if !self.registered {
            return;
        }
        let message = Self::final_message(state);
        info!("unregistering with status {}: {message}", state.status);
        if let Err(e) = self.resource_manager.unregister(state.status, &message) {
            error!("failed to unregister the application master: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::container::ContainerId;
    use crate::coordinator::ClusterEventSender;
    use crate::error::{ClusterError, ClusterResult};

    struct MockResourceManager {
        max_capability: ClusterResult<Resource>,
        registrations: Mutex<u32>,
        unregistered: Mutex<Option<(JobStatus, String)>>,
    }

    impl MockResourceManager {
        fn granting(memory_mb: u64, cpu_cores: u32) -> Self {
            Self {
                max_capability: Ok(Resource {
                    memory_mb,
                    cpu_cores,
                }),
                registrations: Mutex::new(0),
                unregistered: Mutex::new(None),
            }
        }

        fn unreachable() -> Self {
            Self {
                max_capability: Err(ClusterError::InternalError(
                    "resource manager is unreachable".to_string(),
                )),
                registrations: Mutex::new(0),
                unregistered: Mutex::new(None),
            }
        }
    }

    impl ResourceManagerClient for MockResourceManager {
        fn start(&self, _events: ClusterEventSender) -> ClusterResult<()> {
            Ok(())
        }

        fn register(
            &self,
            _host: &str,
            _port: u16,
            _tracking_url: &str,
        ) -> ClusterResult<Resource> {
            *self.registrations.lock().unwrap() += 1;
            match &self.max_capability {
                Ok(resource) => Ok(*resource),
                Err(_) => Err(ClusterError::InternalError(
                    "resource manager is unreachable".to_string(),
                )),
            }
        }

        fn request_container(&self, _resource: Resource, _priority: i32) -> ClusterResult<()> {
            Ok(())
        }

        fn release_container(&self, _container_id: &ContainerId) -> ClusterResult<()> {
            Ok(())
        }

        fn unregister(&self, status: JobStatus, message: &str) -> ClusterResult<()> {
            *self.unregistered.lock().unwrap() = Some((status, message.to_string()));
            Ok(())
        }
    }

    fn lifecycle(resource_manager: Arc<MockResourceManager>) -> LifecycleCoordinator {
        LifecycleCoordinator::new(
            LifecycleOptions {
                listen_host: "0.0.0.0".to_string(),
                listen_port: 0,
                tracking_url: String::new(),
                required_resource: Resource {
                    memory_mb: 1024,
                    cpu_cores: 2,
                },
            },
            resource_manager,
        )
    }

    #[test]
    fn test_registration_with_sufficient_capability() {
        let resource_manager = Arc::new(MockResourceManager::granting(2048, 4));
        let mut coordinator = lifecycle(resource_manager.clone());
        let mut state = JobState::new(1);
        coordinator.on_init(&mut state);
        assert!(!coordinator.should_shutdown(&state));
        assert_eq!(state.status, JobStatus::Undefined);
        assert_eq!(*resource_manager.registrations.lock().unwrap(), 1);
    }

    #[test]
    fn test_capability_rejection_fails_the_job() {
        // The cluster can only grant half the required memory.
        let resource_manager = Arc::new(MockResourceManager::granting(512, 2));
        let mut coordinator = lifecycle(resource_manager.clone());
        let mut state = JobState::new(1);
        coordinator.on_init(&mut state);
        assert!(coordinator.should_shutdown(&state));
        assert_eq!(state.status, JobStatus::Failed);

        coordinator.on_shutdown(&mut state);
        let unregistered = resource_manager.unregistered.lock().unwrap();
        assert_eq!(unregistered.as_ref().map(|(s, _)| *s), Some(JobStatus::Failed));
    }

    #[test]
    fn test_registration_failure_fails_the_job() {
        let resource_manager = Arc::new(MockResourceManager::unreachable());
        let mut coordinator = lifecycle(resource_manager.clone());
        let mut state = JobState::new(1);
        coordinator.on_init(&mut state);
        assert!(coordinator.should_shutdown(&state));
        assert_eq!(state.status, JobStatus::Failed);

        // Never registered, so there is nothing to unregister.
        coordinator.on_shutdown(&mut state);
        assert!(resource_manager.unregistered.lock().unwrap().is_none());
    }

    #[test]
    fn test_reboot_is_rejected() {
        let resource_manager = Arc::new(MockResourceManager::granting(2048, 4));
        let mut coordinator = lifecycle(resource_manager.clone());
        let mut state = JobState::new(1);
        coordinator.on_init(&mut state);
        coordinator.on_reboot(&mut state);
        assert!(coordinator.should_shutdown(&state));
        assert_eq!(state.status, JobStatus::Failed);
    }

    #[test]
    fn test_final_message_names_the_outcome() {
        let mut state = JobState::new(2);
        state.status = JobStatus::Succeeded;
        assert!(LifecycleCoordinator::final_message(&state).contains("2 tasks"));
        state.status = JobStatus::Failed;
        state.too_many_failed_containers = true;
        assert!(LifecycleCoordinator::final_message(&state).contains("retry budget"));
    }
}
