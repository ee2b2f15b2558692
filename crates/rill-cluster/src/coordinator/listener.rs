use crate::container::{ContainerHandle, ContainerId, ContainerStatus};
use crate::state::JobState;

/// A participant in the coordinator's event fan-out.
///
/// Every event is delivered to every listener in registration order; the
/// dispatcher samples [ClusterListener::should_shutdown] after each event
/// and stops cooperatively once any listener signals.
pub trait ClusterListener: Send {
    fn on_init(&mut self, _state: &mut JobState) {}

    fn on_container_allocated(&mut self, _state: &mut JobState, _container: &ContainerHandle) {}

    fn on_container_completed(&mut self, _state: &mut JobState, _status: &ContainerStatus) {}

    fn on_container_released(&mut self, _state: &mut JobState, _container_id: &ContainerId) {}

    fn on_reboot(&mut self, _state: &mut JobState) {}

    fn on_heartbeat(&mut self, _state: &mut JobState) {}

    fn on_shutdown_request(&mut self, _state: &mut JobState) {}

    fn should_shutdown(&self, _state: &JobState) -> bool {
        false
    }

    /// Invoked exactly once, after the event loop has exited.
    fn on_shutdown(&mut self, _state: &mut JobState) {}
}
