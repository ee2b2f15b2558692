use std::collections::BTreeMap;
use std::path::Path;

use log::warn;

use crate::command::{escape_env_value, CommandBuilder, CONTAINER_LOG_DIR};
use crate::container::Credentials;
use crate::error::ClusterResult;

/// How the node manager should treat the localized package.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArchiveKind {
    /// Unpacked into the container working directory before launch.
    Archive,
    /// Copied as a single file.
    File,
}

/// Who may share the localized copy of the package on a node.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceVisibility {
    Application,
    Private,
    Public,
}

/// The deployable package localized into every container.
#[derive(Debug, Clone)]
pub struct PackageResource {
    pub url: String,
    pub size: u64,
    pub timestamp_ms: i64,
    pub kind: ArchiveKind,
    pub visibility: ResourceVisibility,
}

impl PackageResource {
    /// Describe the configured package. Size and timestamp are read from
    /// the local filesystem when the URL points at one; a remote URL keeps
    /// zeros and the node manager validates on localization.
    pub fn from_path(path: &str) -> Self {
        let local = path.strip_prefix("file://").unwrap_or(path);
        let (size, timestamp_ms) = match std::fs::metadata(local) {
            Ok(metadata) => {
                let timestamp = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or_default();
                (metadata.len(), timestamp)
            }
            Err(_) => (0, 0),
        };
        let kind = match Path::new(local).extension().and_then(|e| e.to_str()) {
            Some("tgz") | Some("gz") | Some("tar") | Some("zip") => ArchiveKind::Archive,
            _ => ArchiveKind::File,
        };
        Self {
            url: path.to_string(),
            size,
            timestamp_ms,
            kind,
            visibility: ResourceVisibility::Application,
        }
    }
}

/// Everything the node manager needs to start one worker.
#[derive(Debug, Clone)]
pub struct ContainerLaunchContext {
    pub package: PackageResource,
    /// Environment values are already escaped for the launch script.
    pub environment: BTreeMap<String, String>,
    /// Shell lines executed in order inside the container.
    pub commands: Vec<String>,
    /// Credentials with the application-master token stripped.
    pub credentials: Credentials,
}

/// Assemble the launch context for one worker.
///
/// The worker command is wrapped so that its stdout and stderr land in the
/// container's log directory, and the sanitized credentials are built here,
/// exactly once per launch.
pub fn build_launch_context(
    package: &PackageResource,
    builder: &dyn CommandBuilder,
    credentials: &Credentials,
) -> ClusterResult<ContainerLaunchContext> {
    let command = builder.build_command()?;
    let command = format!(
        "exec {command} 1>{CONTAINER_LOG_DIR}/stdout 2>{CONTAINER_LOG_DIR}/stderr"
    );
    let environment = builder
        .build_environment()
        .into_iter()
        .map(|(key, value)| (key, escape_env_value(&value)))
        .collect();
    let credentials = credentials.sanitized();
    if credentials.is_empty() {
        warn!("launching container with no worker credentials");
    }
    Ok(ContainerLaunchContext {
        package: package.clone(),
        environment,
        commands: vec![command],
        credentials,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::command::ShellCommandBuilder;
    use crate::container::AM_RM_TOKEN_KIND;
    use crate::id::TaskId;

    fn builder() -> ShellCommandBuilder {
        let mut builder = ShellCommandBuilder::new();
        builder.set_name("job-task-0".to_string());
        builder.set_task(TaskId::new(0));
        builder.set_partitions(BTreeSet::new());
        builder
    }

    #[test]
    fn test_command_is_redirected_into_the_log_directory() {
        let package = PackageResource::from_path("/opt/job/package.tgz");
        let context =
            build_launch_context(&package, &builder(), &Credentials::default()).unwrap();
        assert_eq!(context.commands.len(), 1);
        assert!(context.commands[0].starts_with("exec "));
        assert!(context.commands[0].contains("1><LOG_DIR>/stdout"));
        assert!(context.commands[0].contains("2><LOG_DIR>/stderr"));
    }

    #[test]
    fn test_environment_values_are_escaped() {
        let package = PackageResource::from_path("/opt/job/package.tgz");
        let context =
            build_launch_context(&package, &builder(), &Credentials::default()).unwrap();
        assert_eq!(context.environment["RILL_WORKER_NAME"], "'job-task-0'");
    }

    #[test]
    fn test_master_token_never_reaches_the_context() {
        let mut credentials = Credentials::default();
        credentials.insert(AM_RM_TOKEN_KIND, b"secret".to_vec());
        credentials.insert("HDFS_DELEGATION_TOKEN", b"data".to_vec());
        let package = PackageResource::from_path("/opt/job/package.tgz");
        let context = build_launch_context(&package, &builder(), &credentials).unwrap();
        assert!(!context.credentials.contains(AM_RM_TOKEN_KIND));
        assert!(context.credentials.contains("HDFS_DELEGATION_TOKEN"));
    }

    #[test]
    fn test_archive_kind_from_extension() {
        assert_eq!(
            PackageResource::from_path("/opt/job/package.tgz").kind,
            ArchiveKind::Archive
        );
        assert_eq!(
            PackageResource::from_path("file:///opt/job/package.zip").kind,
            ArchiveKind::Archive
        );
        assert_eq!(
            PackageResource::from_path("/opt/job/worker.bin").kind,
            ArchiveKind::File
        );
    }
}
