use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ClusterError, ClusterResult};
use crate::id::TaskId;
use crate::partition::PartitionRef;

/// The token the node manager substitutes with the container's log
/// directory when it materializes the launch script.
pub const CONTAINER_LOG_DIR: &str = "<LOG_DIR>";

/// The name under which the deployable package is localized into each
/// container's working directory.
pub const PACKAGE_LINK_NAME: &str = "__package";

/// Builds the command line and environment for one worker.
///
/// The default implementation runs the package's shell entrypoint; jobs can
/// select another builder through the `task.command_class` configuration.
pub trait CommandBuilder: Send {
    fn set_name(&mut self, name: String);
    fn set_task(&mut self, task_id: TaskId);
    fn set_partitions(&mut self, partitions: BTreeSet<PartitionRef>);
    fn build_command(&self) -> ClusterResult<String>;
    fn build_environment(&self) -> BTreeMap<String, String>;
}

pub fn create_command_builder(kind: &str) -> ClusterResult<Box<dyn CommandBuilder>> {
    match kind {
        "shell" => Ok(Box::new(ShellCommandBuilder::new())),
        other => Err(ClusterError::InvalidArgument(format!(
            "unknown command builder: {other}"
        ))),
    }
}

/// Invokes the deployable package's entrypoint script. The package archive
/// is localized into the container's working directory, so the entrypoint
/// path is relative.
pub struct ShellCommandBuilder {
    name: String,
    task_id: TaskId,
    partitions: BTreeSet<PartitionRef>,
}

impl ShellCommandBuilder {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            task_id: TaskId::new(0),
            partitions: BTreeSet::new(),
        }
    }
}

impl Default for ShellCommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuilder for ShellCommandBuilder {
    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn set_task(&mut self, task_id: TaskId) {
        self.task_id = task_id;
    }

    fn set_partitions(&mut self, partitions: BTreeSet<PartitionRef>) {
        self.partitions = partitions;
    }

    fn build_command(&self) -> ClusterResult<String> {
        if self.name.is_empty() {
            return Err(ClusterError::InvalidArgument(
                "worker name is not set".to_string(),
            ));
        }
        Ok(format!("./{PACKAGE_LINK_NAME}/bin/run-worker.sh"))
    }

    fn build_environment(&self) -> BTreeMap<String, String> {
        let partitions = self
            .partitions
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        BTreeMap::from([
            ("RILL_WORKER_NAME".to_string(), self.name.clone()),
            ("RILL_TASK_ID".to_string(), self.task_id.to_string()),
            ("RILL_TASK_PARTITIONS".to_string(), partitions),
        ])
    }
}

/// Escape a value for interpolation into the node manager's launch script.
/// Single quoting survives every shell metacharacter; embedded single
/// quotes are closed, escaped, and reopened.
pub fn escape_env_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('\'');
    for c in value.chars() {
        if c == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(c);
        }
    }
    escaped.push('\'');
    escaped
}
