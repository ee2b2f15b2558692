mod actor;
mod event;
mod listener;
mod options;

pub use actor::CoordinatorActor;
pub use event::{ClusterEvent, ClusterEventSender};
pub use listener::ClusterListener;
pub use options::CoordinatorOptions;
