use std::time::Duration;

use log::{error, info};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

const ACTOR_MAILBOX_SIZE: usize = 64;

pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options;

    fn name() -> &'static str;
    fn new(options: Self::Options) -> Self;
    fn start(&mut self, ctx: &mut ActorContext<Self>);
    /// Process one message and return the next action.
    /// All messages are processed sequentially on a single task, so this
    /// method must not block; slow outbound work belongs in
    /// [ActorContext::spawn].
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;
    fn stop(self);
}

pub enum ActorAction {
    Continue,
    Stop,
}

pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    /// Tasks spawned by the actor while processing messages.
    /// All outstanding tasks are aborted when the context is dropped.
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    fn new(handle: &ActorHandle<T>) -> Self {
        Self {
            handle: handle.clone(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Enqueue a message for the actor itself without blocking the
    /// dispatcher, even when the mailbox is full.
    pub fn send(&mut self, message: T::Message) {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            let _ = handle.send(message).await;
        });
    }

    /// Enqueue a message for the actor itself after a delay.
    /// The delivery is cancelled if the actor stops first.
    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.send(message).await;
        });
    }

    /// Spawn a task and track its handle in the context.
    pub fn spawn(
        &mut self,
        task: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> AbortHandle {
        self.tasks.spawn(task)
    }

    /// Join tasks that have completed and log join failures.
    /// When the actor expects to handle task errors, the handling belongs
    /// inside the task (e.g. by sending the actor a message).
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("failed to join task spawned by {}: {e}", T::name());
                }
            }
        }
    }
}

pub struct ActorHandle<T: Actor> {
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T: Actor> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    fn new(options: T::Options) -> Self {
        let (tx, rx) = mpsc::channel(ACTOR_MAILBOX_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let handle = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let runner = ActorRunner {
            actor: T::new(options),
            ctx: ActorContext::new(&handle),
            receiver: rx,
            stopped: stopped_tx,
        };
        // The actor runs detached; its event loop task stops by itself
        // when the stop action is taken or all senders are dropped.
        tokio::spawn(runner.run());
        handle
    }

    pub async fn send(&self, message: T::Message) -> Result<(), mpsc::error::SendError<T::Message>> {
        self.sender.send(message).await
    }

    /// Enqueue a message from outside the runtime, blocking while the
    /// mailbox is full. This is how callback threads owned by external
    /// client libraries deliver events; it must not be called from an
    /// asynchronous context.
    pub fn blocking_send(
        &self,
        message: T::Message,
    ) -> Result<(), mpsc::error::SendError<T::Message>> {
        self.sender.blocking_send(message)
    }

    pub async fn wait_for_stop(mut self) {
        // The receiver error means the sender was dropped, so the actor
        // has stopped either way.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

struct ActorRunner<T: Actor> {
    actor: T,
    ctx: ActorContext<T>,
    receiver: mpsc::Receiver<T::Message>,
    stopped: watch::Sender<bool>,
}

impl<T: Actor> ActorRunner<T> {
    async fn run(mut self) {
        info!("starting actor {}", T::name());
        self.actor.start(&mut self.ctx);
        while let Some(message) = self.receiver.recv().await {
            match self.actor.receive(&mut self.ctx, message) {
                ActorAction::Continue => {}
                ActorAction::Stop => break,
            }
            self.ctx.reap();
        }
        self.receiver.close();
        self.actor.stop();
        info!("actor {} has stopped", T::name());
        let _ = self.stopped.send(true);
    }
}

/// A set of actors whose termination can be awaited together.
#[derive(Default)]
pub struct ActorSystem {
    stopped: Vec<watch::Receiver<bool>>,
}

impl ActorSystem {
    pub fn new() -> Self {
        Self { stopped: vec![] }
    }

    pub fn spawn<T: Actor>(&mut self, options: T::Options) -> ActorHandle<T> {
        let handle = ActorHandle::<T>::new(options);
        self.stopped.push(handle.stopped.clone());
        handle
    }

    /// Wait until every actor spawned in the system has stopped.
    pub async fn join(self) {
        for mut stopped in self.stopped {
            let _ = stopped.wait_for(|x| *x).await;
        }
    }
}
