use log::warn;
use rill_server::actor::ActorHandle;

use crate::container::{ContainerHandle, ContainerId, ContainerStatus};
use crate::coordinator::CoordinatorActor;

/// One message on the coordinator's mailbox. Resource-manager callbacks,
/// the heartbeat timer, and self-initiated shutdown all arrive here, which
/// gives the core a totally ordered, single-writer execution.
#[derive(Debug)]
pub enum ClusterEvent {
    ContainerAllocated {
        container: ContainerHandle,
    },
    ContainerCompleted {
        status: ContainerStatus,
    },
    /// Informational acknowledgement of a release; carries no state change
    /// beyond what the matching completion already covers.
    ContainerReleased {
        container_id: ContainerId,
    },
    Reboot,
    ShutdownRequest,
    Heartbeat,
}

/// The delivery path for events produced outside the dispatcher.
/// Client implementations hold one of these and post events from their
/// own tasks or threads.
#[derive(Clone)]
pub struct ClusterEventSender {
    handle: ActorHandle<CoordinatorActor>,
}

impl ClusterEventSender {
    pub(crate) fn new(handle: ActorHandle<CoordinatorActor>) -> Self {
        Self { handle }
    }

    pub async fn send(&self, event: ClusterEvent) {
        if self.handle.send(event).await.is_err() {
            warn!("dropping event: the coordinator has stopped");
        }
    }

    /// Deliver an event from a thread that is not running on the
    /// asynchronous runtime, blocking while the mailbox is full.
    pub fn blocking_send(&self, event: ClusterEvent) {
        if self.handle.blocking_send(event).is_err() {
            warn!("dropping event: the coordinator has stopped");
        }
    }
}
