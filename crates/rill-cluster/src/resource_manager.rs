use crate::container::{ContainerHandle, ContainerId, Resource};
use crate::coordinator::ClusterEventSender;
use crate::error::ClusterResult;
use crate::launch::ContainerLaunchContext;
use crate::state::JobStatus;

/// The application master's side of the cluster resource-manager protocol.
///
/// Implementations deliver allocation and completion callbacks through the
/// [ClusterEventSender] handed to [ResourceManagerClient::start], from
/// whatever threads they own. The outbound calls below are synchronous and
/// short; failures are logged by the caller and not retried here, since a
/// real client carries its own retry policy.
pub trait ResourceManagerClient: Send + Sync + 'static {
    /// Begin delivering cluster events. Called once, before registration.
    fn start(&self, events: ClusterEventSender) -> ClusterResult<()>;

    /// Register the application master and learn the largest capability a
    /// single container can be granted.
    fn register(&self, host: &str, port: u16, tracking_url: &str) -> ClusterResult<Resource>;

    /// Ask for one container with the given capability. Requests may be
    /// over-satisfied; surplus allocations are returned through
    /// [ResourceManagerClient::release_container].
    fn request_container(&self, resource: Resource, priority: i32) -> ClusterResult<()>;

    /// Return an allocation the job does not need.
    fn release_container(&self, container_id: &ContainerId) -> ClusterResult<()>;

    /// Report the job's terminal status and deregister.
    fn unregister(&self, status: JobStatus, message: &str) -> ClusterResult<()>;
}

/// The node-manager side: starting worker processes inside granted
/// containers.
pub trait NodeManagerClient: Send + Sync + 'static {
    fn start(&self) -> ClusterResult<()>;

    fn start_container(
        &self,
        container: &ContainerHandle,
        context: ContainerLaunchContext,
    ) -> ClusterResult<()>;
}
