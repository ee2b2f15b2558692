use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub task: TaskConfig,
    pub container: ContainerConfig,
    pub package: PackageConfig,
    pub heartbeat: HeartbeatConfig,
    pub coordinator: CoordinatorConfig,
    pub status: StatusConfig,
    pub shutdown: ShutdownConfig,
    pub cluster: ClusterConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        let config: Self = Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("RILL_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration errors are fatal at startup, before any cluster
    /// interaction is attempted.
    pub fn validate(&self) -> CommonResult<()> {
        if self.task.count == 0 {
            return Err(CommonError::InvalidArgument(
                "task.count must be positive".to_string(),
            ));
        }
        if self.package.path.is_empty() {
            return Err(CommonError::MissingConfig("package.path".to_string()));
        }
        for input in &self.task.input {
            if input.partitions == 0 {
                return Err(CommonError::InvalidArgument(format!(
                    "input stream {}.{} has no partitions",
                    input.system, input.stream
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// The number of task groups the job is split into.
    pub count: u32,
    /// Selects the command builder used to construct the worker command line.
    pub command_class: String,
    pub input: Vec<InputStreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputStreamConfig {
    pub system: String,
    pub stream: String,
    pub partitions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub memory_mb: u64,
    pub cpu_cores: u32,
    /// The per-task retry budget. Zero fails the job on the first crash;
    /// a negative value retries without bound.
    pub retry_count: i32,
    pub retry_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// The location of the deployable package distributed to containers.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub tracking_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    pub enabled: bool,
    pub listen_host: String,
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight work once shutdown begins.
    /// Zero waits without bound.
    pub grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub kind: ClusterKind,
    /// The number of containers the local cluster can run at once.
    pub slots: u32,
    pub max_memory_mb: u64,
    pub max_cpu_cores: u32,
    pub workdir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    Local,
}
