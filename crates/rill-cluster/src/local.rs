use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use log::{debug, error, info, warn};
use rill_common::config::AppConfig;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};

use crate::command::{CONTAINER_LOG_DIR, PACKAGE_LINK_NAME};
use crate::container::{
    ContainerHandle, ContainerId, ContainerStatus, Resource, RELEASED_EXIT_STATUS,
};
use crate::coordinator::{ClusterEvent, ClusterEventSender};
use crate::error::{ClusterError, ClusterResult};
use crate::launch::ContainerLaunchContext;
use crate::resource_manager::{NodeManagerClient, ResourceManagerClient};
use crate::state::JobStatus;

/// A single-node cluster for development and tests.
///
/// Allocation requests are granted from a bounded slot pool and containers
/// run as local child processes. Each container has a monitor task that
/// waits on the process and reports its exit status to the coordinator as a
/// completion event, the way a real cluster would report it; releasing a
/// running container signals the monitor, which stops the worker and
/// reports the release as the completion.
#[derive(Debug, Clone)]
pub struct LocalClusterOptions {
    pub slots: u32,
    pub max_capability: Resource,
    pub workdir: PathBuf,
}

impl From<&AppConfig> for LocalClusterOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            slots: config.cluster.slots,
            max_capability: Resource {
                memory_mb: config.cluster.max_memory_mb,
                cpu_cores: config.cluster.max_cpu_cores,
            },
            workdir: PathBuf::from(&config.cluster.workdir),
        }
    }
}

enum LocalContainerState {
    Allocated,
    Running {
        /// Signals the monitor task to stop the worker. Taken when the
        /// release is requested; the monitor owns the actual kill and the
        /// completion report.
        release: Option<oneshot::Sender<()>>,
    },
}

#[derive(Default)]
struct LocalClusterState {
    containers: HashMap<ContainerId, LocalContainerState>,
    pending_requests: VecDeque<Resource>,
    slots_in_use: u32,
    next_container: u64,
}

impl LocalClusterState {
    fn grant(&mut self, resource: Resource) -> ContainerHandle {
        self.next_container += 1;
        let id = ContainerId::new(format!("container-{:08}", self.next_container));
        self.slots_in_use += 1;
        self.containers
            .insert(id.clone(), LocalContainerState::Allocated);
        debug!("granting {id} ({resource})");
        ContainerHandle {
            id,
            node_host: "localhost".to_string(),
            node_port: 0,
            resource,
        }
    }

    fn grant_pending(&mut self, slots: u32) -> Vec<ContainerHandle> {
        let mut granted = vec![];
        while self.slots_in_use < slots {
            let Some(resource) = self.pending_requests.pop_front() else {
                break;
            };
            granted.push(self.grant(resource));
        }
        granted
    }
}

struct LocalClusterCore {
    options: LocalClusterOptions,
    events: OnceLock<ClusterEventSender>,
    state: Mutex<LocalClusterState>,
}

impl LocalClusterCore {
    async fn post(&self, event: ClusterEvent) {
        let Some(events) = self.events.get() else {
            warn!("dropping cluster event: the client has not been started");
            return;
        };
        events.send(event).await;
    }

    async fn allocate(&self, resource: Resource) {
        let granted = {
            let mut state = self.state.lock().await;
            if state.slots_in_use < self.options.slots {
                Some(state.grant(resource))
            } else {
                debug!("no free slots; queueing a container request");
                state.pending_requests.push_back(resource);
                None
            }
        };
        if let Some(container) = granted {
            self.post(ClusterEvent::ContainerAllocated { container })
                .await;
        }
    }

    async fn release(&self, container_id: ContainerId) {
        let mut state = self.state.lock().await;
        let signaled = match state.containers.get_mut(&container_id) {
            Some(LocalContainerState::Running { release }) => {
                if let Some(release) = release.take() {
                    let _ = release.send(());
                }
                true
            }
            Some(LocalContainerState::Allocated) | None => false,
        };
        if signaled {
            drop(state);
            self.post(ClusterEvent::ContainerReleased { container_id })
                .await;
            return;
        }
        if state.containers.remove(&container_id).is_none() {
            debug!("ignoring release of unknown container {container_id}");
            return;
        }
        // Never started; retire it here and report the release.
        state.slots_in_use = state.slots_in_use.saturating_sub(1);
        let granted = state.grant_pending(self.options.slots);
        drop(state);
        self.post(ClusterEvent::ContainerReleased {
            container_id: container_id.clone(),
        })
        .await;
        self.post(ClusterEvent::ContainerCompleted {
            status: ContainerStatus {
                container_id,
                exit_status: RELEASED_EXIT_STATUS,
                diagnostics: Some("released before start".to_string()),
            },
        })
        .await;
        for container in granted {
            self.post(ClusterEvent::ContainerAllocated { container })
                .await;
        }
    }

    /// Stop every container still running. The monitors report the
    /// completions, though after unregistration nobody is listening.
    async fn reclaim_all(&self) {
        let mut state = self.state.lock().await;
        for container in state.containers.values_mut() {
            if let LocalContainerState::Running { release } = container {
                if let Some(release) = release.take() {
                    let _ = release.send(());
                }
            }
        }
        state.pending_requests.clear();
    }

    /// Retire a container whose process has exited (or never started) and
    /// report its completion.
    async fn finish_container(
        &self,
        container_id: ContainerId,
        exit_status: i32,
        diagnostics: Option<String>,
    ) {
        let granted = {
            let mut state = self.state.lock().await;
            state.containers.remove(&container_id);
            state.slots_in_use = state.slots_in_use.saturating_sub(1);
            state.grant_pending(self.options.slots)
        };
        self.post(ClusterEvent::ContainerCompleted {
            status: ContainerStatus {
                container_id,
                exit_status,
                diagnostics,
            },
        })
        .await;
        for container in granted {
            self.post(ClusterEvent::ContainerAllocated { container })
                .await;
        }
    }
}

pub struct LocalResourceManager {
    core: Arc<LocalClusterCore>,
}

pub struct LocalNodeManager {
    core: Arc<LocalClusterCore>,
}

pub struct LocalCluster;

impl LocalCluster {
    pub fn create(
        options: LocalClusterOptions,
    ) -> (Arc<LocalResourceManager>, Arc<LocalNodeManager>) {
        let core = Arc::new(LocalClusterCore {
            options,
            events: OnceLock::new(),
            state: Mutex::new(LocalClusterState::default()),
        });
        (
            Arc::new(LocalResourceManager { core: core.clone() }),
            Arc::new(LocalNodeManager { core }),
        )
    }
}

impl ResourceManagerClient for LocalResourceManager {
    fn start(&self, events: ClusterEventSender) -> ClusterResult<()> {
        if self.core.events.set(events).is_err() {
            return Err(ClusterError::InternalError(
                "the resource manager client is already started".to_string(),
            ));
        }
        Ok(())
    }

    fn register(&self, host: &str, port: u16, tracking_url: &str) -> ClusterResult<Resource> {
        info!(
            "registered application master at {host}:{port} (tracking {})",
            if tracking_url.is_empty() {
                "disabled"
            } else {
                tracking_url
            }
        );
        Ok(self.core.options.max_capability)
    }

    fn request_container(&self, resource: Resource, _priority: i32) -> ClusterResult<()> {
        if !self.core.options.max_capability.satisfies(&resource) {
            return Err(ClusterError::InvalidArgument(format!(
                "requested capability {resource} exceeds the cluster maximum {}",
                self.core.options.max_capability
            )));
        }
        let core = self.core.clone();
        tokio::spawn(async move { core.allocate(resource).await });
        Ok(())
    }

    fn release_container(&self, container_id: &ContainerId) -> ClusterResult<()> {
        let core = self.core.clone();
        let container_id = container_id.clone();
        tokio::spawn(async move { core.release(container_id).await });
        Ok(())
    }

    fn unregister(&self, status: JobStatus, message: &str) -> ClusterResult<()> {
        info!("application master unregistered with status {status}: {message}");
        let core = self.core.clone();
        tokio::spawn(async move { core.reclaim_all().await });
        Ok(())
    }
}

impl LocalNodeManager {
    fn container_dir(&self, container_id: &ContainerId) -> PathBuf {
        self.core
            .options
            .workdir
            .join("containers")
            .join(container_id.as_str())
    }

    fn write_launch_script(
        dir: &Path,
        log_dir: &Path,
        context: &ContainerLaunchContext,
    ) -> ClusterResult<PathBuf> {
        let script_path = dir.join("launch_container.sh");
        let mut script = std::fs::File::create(&script_path)?;
        writeln!(script, "#!/bin/sh")?;
        for (key, value) in &context.environment {
            // Values arrive pre-escaped for the launch script.
            writeln!(script, "export {key}={value}")?;
        }
        for command in &context.commands {
            let command = command.replace(CONTAINER_LOG_DIR, &log_dir.to_string_lossy());
            writeln!(script, "{command}")?;
        }
        Ok(script_path)
    }

    fn write_credentials(dir: &Path, context: &ContainerLaunchContext) -> ClusterResult<()> {
        let mut file = std::fs::File::create(dir.join("container.tokens"))?;
        for kind in context.credentials.kinds() {
            writeln!(file, "{kind}")?;
        }
        Ok(())
    }

    fn localize_package(dir: &Path, url: &str) -> ClusterResult<()> {
        let source = url.strip_prefix("file://").unwrap_or(url);
        let link = dir.join(PACKAGE_LINK_NAME);
        if link.exists() {
            return Ok(());
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(source, &link)?;
        #[cfg(not(unix))]
        warn!("package localization is not supported on this platform");
        Ok(())
    }

    /// Wait for the container process or a release signal, whichever comes
    /// first. Every exit path stops the process before reporting, so a
    /// failed wait never leaks a worker.
    async fn monitor(
        core: Arc<LocalClusterCore>,
        container_id: ContainerId,
        mut child: Child,
        released: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            biased;

            _ = released => {
                if let Err(e) = child.kill().await {
                    warn!("failed to stop released container {container_id}: {e}");
                }
                core.finish_container(
                    container_id,
                    RELEASED_EXIT_STATUS,
                    Some("container released on request".to_string()),
                )
                .await;
            }
            result = child.wait() => match result {
                Ok(status) => {
                    let exit_status = status.code().unwrap_or(-1);
                    core.finish_container(container_id, exit_status, None).await;
                }
                Err(e) => {
                    error!("failed to wait for container {container_id}: {e}");
                    if let Err(e) = child.kill().await {
                        warn!("failed to stop container {container_id}: {e}");
                    }
                    core.finish_container(container_id, -1, Some(e.to_string())).await;
                }
            },
        }
    }
}

impl NodeManagerClient for LocalNodeManager {
    fn start(&self) -> ClusterResult<()> {
        std::fs::create_dir_all(self.core.options.workdir.join("containers"))?;
        Ok(())
    }

    fn start_container(
        &self,
        container: &ContainerHandle,
        context: ContainerLaunchContext,
    ) -> ClusterResult<()> {
        let dir = self.container_dir(&container.id);
        let log_dir = dir.join("logs");
        std::fs::create_dir_all(&log_dir)?;
        Self::localize_package(&dir, &context.package.url)?;
        Self::write_credentials(&dir, &context)?;
        let script = Self::write_launch_script(&dir, &log_dir, &context)?;
        let child = Command::new("sh")
            .arg(&script)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let core = self.core.clone();
                let container_id = container.id.clone();
                let diagnostics = format!("failed to spawn the container process: {e}");
                tokio::spawn(async move {
                    core.finish_container(container_id, -1, Some(diagnostics)).await;
                });
                return Err(e.into());
            }
        };
        info!(
            "started container {} (pid {})",
            container.id,
            child.id().unwrap_or(0)
        );
        let (release_tx, release_rx) = oneshot::channel();
        let core = self.core.clone();
        let container_id = container.id.clone();
        tokio::spawn(async move {
            {
                let mut state = core.state.lock().await;
                state.containers.insert(
                    container_id.clone(),
                    LocalContainerState::Running {
                        release: Some(release_tx),
                    },
                );
            }
            Self::monitor(core, container_id, child, release_rx).await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LocalClusterOptions {
        LocalClusterOptions {
            slots: 1,
            max_capability: Resource {
                memory_mb: 4096,
                cpu_cores: 4,
            },
            workdir: std::env::temp_dir().join("rill-local-test"),
        }
    }

    const RESOURCE: Resource = Resource {
        memory_mb: 1024,
        cpu_cores: 1,
    };

    #[tokio::test]
    async fn test_requests_queue_when_the_pool_is_full() {
        let (resource_manager, _node_manager) = LocalCluster::create(options());
        resource_manager.core.allocate(RESOURCE).await;
        resource_manager.core.allocate(RESOURCE).await;
        {
            let state = resource_manager.core.state.lock().await;
            assert_eq!(state.slots_in_use, 1);
            assert_eq!(state.pending_requests.len(), 1);
        }
        // Releasing the granted container frees the slot for the queued
        // request.
        resource_manager
            .core
            .release(ContainerId::new("container-00000001"))
            .await;
        let state = resource_manager.core.state.lock().await;
        assert_eq!(state.slots_in_use, 1);
        assert!(state.pending_requests.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_requests_are_rejected() {
        let (resource_manager, _node_manager) = LocalCluster::create(options());
        let oversized = Resource {
            memory_mb: 65536,
            cpu_cores: 1,
        };
        assert!(resource_manager.request_container(oversized, 0).is_err());
    }

    #[tokio::test]
    async fn test_release_of_unknown_containers_is_ignored() {
        let (resource_manager, _node_manager) = LocalCluster::create(options());
        resource_manager
            .core
            .release(ContainerId::new("container-unknown"))
            .await;
        let state = resource_manager.core.state.lock().await;
        assert_eq!(state.slots_in_use, 0);
    }

    #[tokio::test]
    async fn test_release_signals_the_monitor() {
        let (resource_manager, _node_manager) = LocalCluster::create(options());
        let (release_tx, release_rx) = oneshot::channel();
        let container_id = {
            let mut state = resource_manager.core.state.lock().await;
            let container = state.grant(RESOURCE);
            state.containers.insert(
                container.id.clone(),
                LocalContainerState::Running {
                    release: Some(release_tx),
                },
            );
            container.id
        };
        resource_manager.core.release(container_id.clone()).await;
        // The monitor owns the kill and the completion report, so the slot
        // stays occupied until it finishes.
        assert!(release_rx.await.is_ok());
        let state = resource_manager.core.state.lock().await;
        assert_eq!(state.slots_in_use, 1);
        // A second release finds the signal already taken and does not
        // retire the container a second time.
        drop(state);
        resource_manager.core.release(container_id).await;
        let state = resource_manager.core.state.lock().await;
        assert_eq!(state.slots_in_use, 1);
    }
}
