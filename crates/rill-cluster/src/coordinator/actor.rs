use log::{error, info};
use rill_server::actor::{Actor, ActorAction, ActorContext};

use crate::coordinator::{ClusterEvent, ClusterEventSender, ClusterListener, CoordinatorOptions};
use crate::lifecycle::{LifecycleCoordinator, LifecycleOptions};
use crate::state::{JobState, JobStatus};
use crate::task_manager::{TaskManager, TaskManagerOptions};

/// The application master's event loop.
///
/// The actor owns the job state and an ordered list of listeners; the
/// lifecycle coordinator is registered before the task manager so that a
/// capability rejection prevents the task manager from ever requesting
/// containers.
pub struct CoordinatorActor {
    options: CoordinatorOptions,
    state: JobState,
    listeners: Vec<Box<dyn ClusterListener>>,
    shutdown_requested: bool,
}

impl Actor for CoordinatorActor {
    type Message = ClusterEvent;
    type Options = CoordinatorOptions;

    fn name() -> &'static str {
        "CoordinatorActor"
    }

    fn new(options: CoordinatorOptions) -> Self {
        let lifecycle = LifecycleCoordinator::new(
            LifecycleOptions::new(&options),
            options.resource_manager.clone(),
        );
        let task_manager = TaskManager::new(
            TaskManagerOptions::new(&options),
            options.resource_manager.clone(),
            options.node_manager.clone(),
            options.clock.clone(),
        );
        let state = JobState::new(options.task_count);
        Self {
            options,
            state,
            listeners: vec![Box::new(lifecycle), Box::new(task_manager)],
            shutdown_requested: false,
        }
    }

    fn start(&mut self, ctx: &mut ActorContext<Self>) {
        let events = ClusterEventSender::new(ctx.handle().clone());
        if let Err(e) = self.options.resource_manager.start(events) {
            error!("failed to start the resource manager client: {e}");
            self.state.status = JobStatus::Failed;
            self.shutdown_requested = true;
        }
        if !self.shutdown_requested {
            for listener in self.listeners.iter_mut() {
                listener.on_init(&mut self.state);
                if listener.should_shutdown(&self.state) {
                    break;
                }
            }
        }
        self.publish_snapshot();
        if self.should_stop() {
            // Wake the loop so the stop decision is taken immediately.
            ctx.send(ClusterEvent::ShutdownRequest);
        } else {
            ctx.send_with_delay(ClusterEvent::Heartbeat, self.options.heartbeat_interval);
        }
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, event: ClusterEvent) -> ActorAction {
        match event {
            ClusterEvent::ContainerAllocated { container } => {
                for listener in self.listeners.iter_mut() {
                    listener.on_container_allocated(&mut self.state, &container);
                }
            }
            ClusterEvent::ContainerCompleted { status } => {
                for listener in self.listeners.iter_mut() {
                    listener.on_container_completed(&mut self.state, &status);
                }
            }
            ClusterEvent::ContainerReleased { container_id } => {
                for listener in self.listeners.iter_mut() {
                    listener.on_container_released(&mut self.state, &container_id);
                }
            }
            ClusterEvent::Reboot => {
                for listener in self.listeners.iter_mut() {
                    listener.on_reboot(&mut self.state);
                }
            }
            ClusterEvent::ShutdownRequest => {
                info!("shutdown requested");
                self.shutdown_requested = true;
                for listener in self.listeners.iter_mut() {
                    listener.on_shutdown_request(&mut self.state);
                }
            }
            ClusterEvent::Heartbeat => {
                for listener in self.listeners.iter_mut() {
                    listener.on_heartbeat(&mut self.state);
                }
                ctx.send_with_delay(ClusterEvent::Heartbeat, self.options.heartbeat_interval);
            }
        }
        self.publish_snapshot();
        if self.should_stop() {
            ActorAction::Stop
        } else {
            ActorAction::Continue
        }
    }

    fn stop(mut self) {
        info!("unwinding with job status {}", self.state.status);
        for listener in self.listeners.iter_mut() {
            listener.on_shutdown(&mut self.state);
        }
        self.publish_snapshot();
    }
}

impl CoordinatorActor {
    fn should_stop(&self) -> bool {
        self.shutdown_requested
            || self
                .listeners
                .iter()
                .any(|listener| listener.should_shutdown(&self.state))
    }

    fn publish_snapshot(&self) {
        self.options.snapshot.send_replace(self.state.snapshot());
    }
}
