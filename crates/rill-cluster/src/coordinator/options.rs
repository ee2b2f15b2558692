use std::sync::Arc;
use std::time::Duration;

use rill_common::config::AppConfig;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::command::create_command_builder;
use crate::container::{Credentials, Resource};
use crate::error::ClusterResult;
use crate::launch::PackageResource;
use crate::partition::PartitionRef;
use crate::resource_manager::{NodeManagerClient, ResourceManagerClient};
use crate::state::JobStateSnapshot;

pub struct CoordinatorOptions {
    pub task_count: u32,
    pub container_resource: Resource,
    pub retry_count: i32,
    pub retry_window_ms: u64,
    pub package: PackageResource,
    pub command_class: String,
    pub all_partitions: Vec<PartitionRef>,
    pub heartbeat_interval: Duration,
    pub listen_host: String,
    pub listen_port: u16,
    pub tracking_url: String,
    pub credentials: Credentials,
    pub resource_manager: Arc<dyn ResourceManagerClient>,
    pub node_manager: Arc<dyn NodeManagerClient>,
    pub clock: Arc<dyn Clock>,
    pub snapshot: watch::Sender<JobStateSnapshot>,
}

impl CoordinatorOptions {
    pub fn try_new(
        config: &AppConfig,
        resource_manager: Arc<dyn ResourceManagerClient>,
        node_manager: Arc<dyn NodeManagerClient>,
        clock: Arc<dyn Clock>,
        credentials: Credentials,
        snapshot: watch::Sender<JobStateSnapshot>,
    ) -> ClusterResult<Self> {
        config.validate()?;
        // Reject an unknown builder before any cluster interaction.
        create_command_builder(&config.task.command_class)?;
        let all_partitions = config
            .task
            .input
            .iter()
            .flat_map(|input| {
                (0..input.partitions)
                    .map(|p| PartitionRef::new(input.system.clone(), input.stream.clone(), p))
            })
            .collect();
        Ok(Self {
            task_count: config.task.count,
            container_resource: Resource {
                memory_mb: config.container.memory_mb,
                cpu_cores: config.container.cpu_cores,
            },
            retry_count: config.container.retry_count,
            retry_window_ms: config.container.retry_window_ms,
            package: PackageResource::from_path(&config.package.path),
            command_class: config.task.command_class.clone(),
            all_partitions,
            heartbeat_interval: Duration::from_millis(config.heartbeat.interval_ms),
            listen_host: config.coordinator.listen_host.clone(),
            listen_port: config.coordinator.listen_port,
            tracking_url: config.coordinator.tracking_url.clone(),
            credentials,
            resource_manager,
            node_manager,
            clock,
            snapshot,
        })
    }
}
